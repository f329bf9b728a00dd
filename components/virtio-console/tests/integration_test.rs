//! Integration tests for the virtio console device
//!
//! A simulated guest driver runs the initialisation sequence, offers
//! buffers and checks what the device put into the used rings.

use cons_ring::RingBuffer;
use cons_virtio::testing::{GuestDriver, GUEST_BASE};
use cons_virtio::{
    DescFlags, DeviceStatus, IrqCounter, QueueState, VirtioConsole, VirtioError, RECEIVEQ,
    TRANSMITQ,
};

fn device() -> (VirtioConsole, IrqCounter) {
    let irq = IrqCounter::new();
    (VirtioConsole::new(32, Box::new(irq.clone())), irq)
}

#[test]
fn test_host_output_spread_over_small_buffers() {
    let (mut dev, irq) = device();
    let mut guest = GuestDriver::start(&mut dev, 8).unwrap();
    let a = guest.offer_writable(&mut dev, RECEIVEQ, 3).unwrap();
    let b = guest.offer_writable(&mut dev, RECEIVEQ, 3).unwrap();

    let mut ring = RingBuffer::new(16);
    ring.put_slice(b"abcdefgh");
    assert_eq!(dev.transmit_from(&mut ring).unwrap(), 6);

    assert_eq!(guest.read_bytes(&dev, a, 3).unwrap(), b"abc");
    assert_eq!(guest.read_bytes(&dev, b, 3).unwrap(), b"def");
    assert_eq!(guest.used(&dev, RECEIVEQ).unwrap(), vec![(0, 3), (1, 3)]);
    // One interrupt per batch, not per buffer
    assert_eq!(irq.count(), 1);

    // Remainder goes out once the guest offers more space
    let c = guest.offer_writable(&mut dev, RECEIVEQ, 8).unwrap();
    assert_eq!(dev.transmit_from(&mut ring).unwrap(), 2);
    assert_eq!(guest.read_bytes(&dev, c, 2).unwrap(), b"gh");
    assert!(ring.is_empty());
}

#[test]
fn test_wrapped_ring_is_sent_in_order() {
    let (mut dev, _) = device();
    let mut guest = GuestDriver::start(&mut dev, 4).unwrap();
    let addr = guest.offer_writable(&mut dev, RECEIVEQ, 16).unwrap();

    let mut ring = RingBuffer::new(8);
    ring.put_slice(b"xxxxx");
    ring.clear(5);
    ring.put_slice(b"123456");

    assert_eq!(dev.transmit_from(&mut ring).unwrap(), 6);
    assert_eq!(guest.read_bytes(&dev, addr, 6).unwrap(), b"123456");
}

#[test]
fn test_chained_transmit_buffers() {
    let (mut dev, _) = device();
    let mut guest = GuestDriver::start(&mut dev, 8).unwrap();
    guest.offer_readable(&mut dev, TRANSMITQ, b"one ").unwrap();
    guest.offer_readable(&mut dev, TRANSMITQ, b"two\n").unwrap();
    assert!(dev.has_guest_data());

    let mut received = Vec::new();
    let n = dev
        .receive(&mut |data: &[u8]| received.extend_from_slice(data))
        .unwrap();
    assert_eq!(n, 8);
    assert_eq!(received, b"one two\n");
    assert!(!dev.has_guest_data());
    assert_eq!(guest.used(&dev, TRANSMITQ).unwrap().len(), 2);
}

#[test]
fn test_buffer_outside_registered_memory() {
    let (mut dev, irq) = device();
    let mut guest = GuestDriver::start(&mut dev, 8).unwrap();
    guest
        .offer_raw(&mut dev, TRANSMITQ, &[(GUEST_BASE - 0x1000, 16, DescFlags::empty())])
        .unwrap();

    let result = dev.receive(&mut |_: &[u8]| {});
    assert!(matches!(result, Err(VirtioError::RegionFault { .. })));
    assert!(dev.status().contains(DeviceStatus::NEEDS_RESET));
    assert_eq!(dev.queue(TRANSMITQ).unwrap().state(), QueueState::Disabled);
    assert_eq!(irq.count(), 1);

    // Further traffic is ignored until the guest resets
    let mut ring = RingBuffer::new(8);
    ring.put_slice(b"x");
    assert_eq!(dev.transmit_from(&mut ring).unwrap(), 0);
}

#[test]
fn test_reset_and_reinitialise() {
    let (mut dev, _) = device();
    GuestDriver::start(&mut dev, 8).unwrap();
    dev.set_status(DeviceStatus::empty());
    assert!(!dev.is_ready());

    let mut guest = GuestDriver::start(&mut dev, 8).unwrap();
    assert!(dev.is_ready());
    let addr = guest.offer_writable(&mut dev, RECEIVEQ, 4).unwrap();

    let mut ring = RingBuffer::new(8);
    ring.put_slice(b"ok");
    assert_eq!(dev.transmit_from(&mut ring).unwrap(), 2);
    assert_eq!(guest.read_bytes(&dev, addr, 2).unwrap(), b"ok");
}
