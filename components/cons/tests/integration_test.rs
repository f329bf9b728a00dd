//! Integration tests for the console server
//!
//! Drive a server the way an event loop would: channel requests, peer
//! writes, frontend input, guest kicks and timer expiry, all against a
//! manual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use cons::{
    BufferFrontend, ChannelRequest, ClientId, ConsConfig, ConsError, ConsServer, MuxId,
    OutputFlags, ReadStatus, VirtioChannel, VirtioFrontend,
};
use cons_broker::{Clock, ManualClock};
use cons_virtio::testing::GuestDriver;
use cons_virtio::{IrqCounter, VirtioConsole, RECEIVEQ, TRANSMITQ};

fn setup(config: ConsConfig) -> (ConsServer, Arc<ManualClock>, MuxId, BufferFrontend) {
    let clock = Arc::new(ManualClock::new());
    let mut server = ConsServer::new(config, clock.clone()).unwrap();
    let mux = server.add_mux("main");
    let fe = BufferFrontend::new();
    server.add_frontend(mux, Box::new(fe.clone())).unwrap();
    (server, clock, mux, fe)
}

fn connected(server: &mut ConsServer, mux: MuxId, req: ChannelRequest) -> ClientId {
    let id = server.create_channel(req).unwrap();
    server.connect(mux, id).unwrap();
    id
}

#[test]
fn test_onlcr_only() {
    let (mut server, _, mux, fe) = setup(ConsConfig::default());
    let id = connected(&mut server, mux, ChannelRequest::vcon("vm").option("no-line-buffering"));

    let mut attr = server.get_attr(id).unwrap();
    attr.oflags = OutputFlags::ONLCR;
    server.set_attr(id, attr).unwrap();
    fe.take_output();

    server.write(id, b"abc\n").unwrap();
    assert_eq!(fe.output(), b"abc\r\n");
}

#[test]
fn test_line_buffering_with_delay() {
    let (mut server, clock, mux, fe) = setup(ConsConfig::default());
    let id = connected(
        &mut server,
        mux,
        ChannelRequest::vcon("vm").option("line-buffered-ms=100"),
    );
    let mut attr = server.get_attr(id).unwrap();
    attr.oflags = OutputFlags::empty();
    server.set_attr(id, attr).unwrap();
    fe.take_output();

    server.write(id, b"partial").unwrap();
    assert!(fe.output().is_empty());
    clock.advance(Duration::from_millis(100));
    assert_eq!(server.run_timers(clock.now()), 1);
    assert_eq!(fe.take_output(), b"partial");

    server.write(id, b"line1\nline2").unwrap();
    assert_eq!(fe.take_output(), b"line1\n");
    clock.advance(Duration::from_millis(99));
    server.run_timers(clock.now());
    assert!(fe.output().is_empty());
    clock.advance(Duration::from_millis(1));
    server.run_timers(clock.now());
    assert_eq!(fe.take_output(), b"line2");
}

#[test]
fn test_rearm_replaces_timer() {
    let (mut server, clock, mux, fe) = setup(ConsConfig::default());
    let id = connected(&mut server, mux, ChannelRequest::vcon("vm"));
    fe.take_output();

    server.write(id, b"a").unwrap();
    clock.advance(Duration::from_millis(30));
    server.write(id, b"b").unwrap();
    assert_eq!(server.next_deadline(), Some(clock.now() + Duration::from_millis(50)));

    clock.advance(Duration::from_millis(20));
    assert_eq!(server.run_timers(clock.now()), 0);
    clock.advance(Duration::from_millis(30));
    assert_eq!(server.run_timers(clock.now()), 1);
    assert_eq!(fe.output(), b"ab");
}

#[test]
fn test_timestamps() {
    let wall = NaiveDate::from_ymd_opt(2024, 5, 17)
        .unwrap()
        .and_hms_opt(8, 30, 0)
        .unwrap();
    let clock = Arc::new(ManualClock::with_wall_time(wall));
    let mut server = ConsServer::new(ConsConfig::default(), clock.clone()).unwrap();
    let mux = server.add_mux("main");
    let fe = BufferFrontend::new();
    server.add_frontend(mux, Box::new(fe.clone())).unwrap();

    let id = connected(&mut server, mux, ChannelRequest::vcon("vm").option("timestamp"));
    fe.take_output();

    server.write(id, b"one\ntwo\n").unwrap();
    assert_eq!(
        fe.output_string(),
        "[2024-05-17 08:30:00] one\r\n[2024-05-17 08:30:00] two\r\n"
    );
}

#[test]
fn test_identity_resolution() {
    let (mut server, _, _, _) = setup(ConsConfig::default());
    let first = server.create_channel(ChannelRequest::vcon("x")).unwrap();
    let second = server.create_channel(ChannelRequest::vcon("x")).unwrap();

    assert_eq!(server.client(first).unwrap().idx(), 0);
    assert_eq!(server.client(second).unwrap().idx(), 1);
    assert_eq!(server.find_by_name("x:1"), Some(second));
    assert_eq!(server.find_by_name("x"), Some(first));

    server.destroy(first).unwrap();
    assert_eq!(server.find_by_name("x"), None);
    assert_eq!(server.find_by_tag("x"), Some(second));
}

#[test]
fn test_keep_semantics() {
    let (mut server, _, _, _) = setup(ConsConfig::default());
    let plain = server.create_channel(ChannelRequest::vcon("plain")).unwrap();
    let kept = server
        .create_channel(ChannelRequest::vcon("kept").option("keep"))
        .unwrap();

    server.write(kept, b"log line\n").unwrap();
    server.deliver_input(kept, b"typed", false).unwrap();

    assert!(server.disconnect(plain).unwrap());
    assert!(server.client(plain).is_none());

    assert!(!server.disconnect(kept).unwrap());
    let client = server.client(kept).unwrap();
    assert!(client.dead());
    // "log line\r\n" plus the echoed input
    assert_eq!(client.wbuf().len(), 15);

    let mut buf = [0u8; 16];
    let r = server.read(kept, &mut buf).unwrap();
    assert_eq!(&buf[..r.len], b"typed");
}

#[test]
fn test_registry_exhaustion() {
    let config = ConsConfig {
        max_objects: 3,
        ..ConsConfig::default()
    };
    let (mut server, _, _, _) = setup(config);

    server.create_channel(ChannelRequest::vcon("a")).unwrap();
    let err = server.create_channel(ChannelRequest::vcon("b")).unwrap_err();
    assert!(matches!(err, ConsError::ResourceExhausted(_)));
    assert_eq!(server.controller().len(), 1);
    assert!(server.find_by_tag("b").is_none());
}

#[test]
fn test_shown_clients_are_prefixed() {
    let (mut server, _, mux, fe) = setup(ConsConfig::default());
    let shell = connected(&mut server, mux, ChannelRequest::vcon("shell"));
    let log = server
        .create_channel(ChannelRequest::vcon("log").option("show").option("key=l"))
        .unwrap();
    fe.take_output();

    server.write(shell, b"$ ").unwrap();
    server.on_timeout(shell);
    server.write(log, b"event\n").unwrap();
    assert_eq!(fe.output_string(), "$ \r\n\x1b[37mlog\x1b[0m: event\r\n");
}

#[test]
fn test_read_respects_breaks() {
    let (mut server, _, mux, fe) = setup(ConsConfig::default());
    let id = connected(&mut server, mux, ChannelRequest::vcon("sh"));

    fe.push_input(b"ab");
    server.service_frontend(mux, 0).unwrap();
    fe.push_break();
    fe.push_input(b"cd");
    server.service_frontend(mux, 0).unwrap();

    let mut buf = [0u8; 16];
    let r = server.read(id, &mut buf).unwrap();
    assert_eq!(&buf[..r.len], b"ab");
    assert!(!r.status.contains(ReadStatus::DONE));

    let r = server.read(id, &mut buf).unwrap();
    assert_eq!(&buf[..r.len], b"cd");
    assert_eq!(r.status, ReadStatus::BREAK | ReadStatus::DONE);
}

fn virtio_channel(server: &mut ConsServer, id: ClientId) -> &mut VirtioChannel {
    server
        .client_mut(id)
        .unwrap()
        .transport_mut()
        .as_any_mut()
        .downcast_mut::<VirtioChannel>()
        .unwrap()
}

#[test]
fn test_virtio_channel_round_trip() {
    let (mut server, _, mux, fe) = setup(ConsConfig::default());
    let irq = IrqCounter::new();
    let id = connected(
        &mut server,
        mux,
        ChannelRequest::virtio("guest", Box::new(irq.clone())).option("no-line-buffering"),
    );
    let mut guest = GuestDriver::start(virtio_channel(&mut server, id).device_mut(), 16).unwrap();
    fe.take_output();

    // Guest console output reaches the frontend untouched
    guest
        .offer_readable(virtio_channel(&mut server, id).device_mut(), TRANSMITQ, b"login: ")
        .unwrap();
    server.kick_client(id).unwrap();
    assert_eq!(fe.take_output(), b"login: ");

    // Operator input goes to the guest, a small buffer takes part of it
    let small = guest
        .offer_writable(virtio_channel(&mut server, id).device_mut(), RECEIVEQ, 2)
        .unwrap();
    fe.push_input(b"root\r");
    server.service_frontend(mux, 0).unwrap();

    let dev = virtio_channel(&mut server, id).device();
    assert_eq!(guest.read_bytes(dev, small, 2).unwrap(), b"ro");
    assert_eq!(server.client(id).unwrap().rbuf().len(), 3);

    // The rest follows once the guest offers room
    let big = guest
        .offer_writable(virtio_channel(&mut server, id).device_mut(), RECEIVEQ, 16)
        .unwrap();
    server.kick_client(id).unwrap();
    let dev = virtio_channel(&mut server, id).device();
    assert_eq!(guest.read_bytes(dev, big, 3).unwrap(), b"ot\r");
    assert_eq!(guest.used(dev, RECEIVEQ).unwrap(), vec![(0, 2), (1, 3)]);
    assert!(server.client(id).unwrap().rbuf().is_empty());
}

#[test]
fn test_virtio_violation_keeps_server_running() {
    let (mut server, _, mux, _) = setup(ConsConfig::default());
    let bad = server
        .create_channel(ChannelRequest::virtio("bad", Box::new(IrqCounter::new())))
        .unwrap();
    let good = connected(&mut server, mux, ChannelRequest::vcon("good"));

    let mut guest = GuestDriver::start(virtio_channel(&mut server, bad).device_mut(), 8).unwrap();
    guest
        .offer_raw(
            virtio_channel(&mut server, bad).device_mut(),
            TRANSMITQ,
            &[(0x1000, 4, cons_virtio::DescFlags::empty())],
        )
        .unwrap();

    assert!(matches!(server.kick_client(bad), Err(ConsError::Virtio(_))));
    assert!(!virtio_channel(&mut server, bad).device().is_ready());
    server.write(good, b"still alive\n").unwrap();
}

fn virtio_frontend(server: &mut ConsServer, mux: MuxId) -> &mut VirtioFrontend {
    server
        .mux_mut(mux)
        .unwrap()
        .frontend_mut(0)
        .unwrap()
        .as_any_mut()
        .downcast_mut::<VirtioFrontend>()
        .unwrap()
}

#[test]
fn test_virtio_frontend_delivers_remainder_in_order() {
    let clock = Arc::new(ManualClock::new());
    let mut server = ConsServer::new(ConsConfig::default(), clock).unwrap();
    let mux = server.add_mux("guest-console");
    let id = server
        .create_channel(ChannelRequest::vcon("vm").option("no-line-buffering"))
        .unwrap();

    let mut device = VirtioConsole::new(16, Box::new(IrqCounter::new()));
    let mut guest = GuestDriver::start(&mut device, 16).unwrap();
    let first = guest.offer_writable(&mut device, RECEIVEQ, 4).unwrap();
    server
        .add_frontend(mux, Box::new(VirtioFrontend::new(device, 256)))
        .unwrap();
    server.connect(mux, id).unwrap();

    server.write(id, b"hello world\n").unwrap();
    let fe = virtio_frontend(&mut server, mux);
    assert_eq!(guest.read_bytes(fe.device(), first, 4).unwrap(), b"hell");
    assert_eq!(fe.pending(), 9);

    let second = guest.offer_writable(fe.device_mut(), RECEIVEQ, 32).unwrap();
    server.service_frontend(mux, 0).unwrap();
    let fe = virtio_frontend(&mut server, mux);
    assert_eq!(guest.read_bytes(fe.device(), second, 9).unwrap(), b"o world\r\n");
    assert_eq!(fe.pending(), 0);
}

#[test]
fn test_virtio_frontend_holds_output_until_guest_offers() {
    let clock = Arc::new(ManualClock::new());
    let mut server = ConsServer::new(ConsConfig::default(), clock).unwrap();
    let mux = server.add_mux("guest-console");
    let id = server
        .create_channel(ChannelRequest::vcon("vm").option("no-line-buffering"))
        .unwrap();

    let mut device = VirtioConsole::new(16, Box::new(IrqCounter::new()));
    let mut guest = GuestDriver::start(&mut device, 16).unwrap();
    server
        .add_frontend(mux, Box::new(VirtioFrontend::new(device, 256)))
        .unwrap();
    server.connect(mux, id).unwrap();
    server.set_attr(id, cons::VconAttr::raw()).unwrap();

    let data: Vec<u8> = (0..400).map(|i| b'a' + (i % 26) as u8).collect();
    server.write(id, &data).unwrap();
    assert_eq!(virtio_frontend(&mut server, mux).pending(), 400);

    let fe = virtio_frontend(&mut server, mux);
    let addr = guest.offer_writable(fe.device_mut(), RECEIVEQ, 1024).unwrap();
    server.service_frontend(mux, 0).unwrap();
    let fe = virtio_frontend(&mut server, mux);
    assert_eq!(guest.used(fe.device(), RECEIVEQ).unwrap(), vec![(0, 400)]);
    assert_eq!(guest.read_bytes(fe.device(), addr, 400).unwrap(), data);
    assert_eq!(fe.pending(), 0);
}

#[test]
fn test_virtio_frontend_input_reaches_connected_client() {
    let clock = Arc::new(ManualClock::new());
    let mut server = ConsServer::new(ConsConfig::default(), clock).unwrap();
    let mux = server.add_mux("guest-console");
    let id = server.create_channel(ChannelRequest::vcon("vm")).unwrap();

    let mut device = VirtioConsole::new(16, Box::new(IrqCounter::new()));
    let mut guest = GuestDriver::start(&mut device, 16).unwrap();
    guest.offer_readable(&mut device, TRANSMITQ, b"reboot\r").unwrap();
    server
        .add_frontend(mux, Box::new(VirtioFrontend::new(device, 256)))
        .unwrap();
    server.connect(mux, id).unwrap();
    server.set_attr(id, cons::VconAttr::raw()).unwrap();

    server.service_frontend(mux, 0).unwrap();
    let mut buf = [0u8; 16];
    let r = server.read(id, &mut buf).unwrap();
    assert_eq!(&buf[..r.len], b"reboot\r");
}
