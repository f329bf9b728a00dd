//! Line discipline
//!
//! Output written to a client is cooked (line endings rewritten, lines
//! timestamped) into the client's output ring and handed to the attached
//! multiplexer in batches. The ring is circular and the multiplexer may
//! still be behind, so a batch never grows far enough to overwrite output
//! that was not handed over yet:
//!
//! ```text
//!        first_unwritten            head
//!              │                     │
//!  ────────────▼─────────────────────▼──────────────────────────
//!   handed out │  waiting for output │  free for this batch  │░│
//!  ─────────────────────────────────────────────────────────────
//!                                      └ minus timestamp and \r ┘
//! ```
//!
//! With line buffering only complete lines are handed out; an incomplete
//! line is flushed by a one-shot timer, or at once if it fills the ring.

use std::time::Duration;

use cons_broker::Clock;
use cons_ring::{Index, RingBuffer};

use crate::attr::{InputFlags, LocalFlags, OutputFlags, VconAttr};
use crate::client::Client;
use crate::mux::OutputMux;

/// Room reserved in a batch for one timestamp
pub const MAX_TIMESTAMP_LEN: usize = 25;

const UNKNOWN_TIME: &str = "[unknown] ";

/// Timestamp prefix for a new output line
pub fn format_timestamp(clock: &dyn Clock) -> String {
    match clock.local_time() {
        Some(t) => t.format("[%Y-%m-%d %H:%M:%S] ").to_string(),
        None => UNKNOWN_TIME.to_string(),
    }
}

fn put_timestamp(wbuf: &mut RingBuffer, clock: &dyn Clock) {
    let ts = format_timestamp(clock);
    let len = ts.len().min(MAX_TIMESTAMP_LEN);
    wbuf.put_slice(&ts.as_bytes()[..len]);
}

/// Cook `data` into the client's output ring and hand it to `out`
///
/// `out` is the multiplexer the client is shown on, `None` if hidden. A
/// hidden client buffers without limit and nothing is pending afterwards.
///
/// # Returns
/// The delay after which the flush timer must be re-armed, `None` if no
/// incomplete line is held back.
pub fn cooked_write(
    client: &mut Client,
    data: &[u8],
    mut out: Option<&mut dyn OutputMux>,
    clock: &dyn Clock,
) -> Option<Duration> {
    let mut last_nl = client.first_unwritten;
    let mut rest = data;

    while !rest.is_empty() {
        let mut max_batch = if out.is_some() {
            let w = &client.wbuf;
            let room = w.distance(w.head(), client.first_unwritten.prev()) as isize;
            room - MAX_TIMESTAMP_LEN as isize - 1
        } else {
            isize::MAX
        };

        let mut batch = 0usize;
        while batch < rest.len() && (batch as isize) < max_batch {
            if client.new_line && client.timestamp {
                put_timestamp(&mut client.wbuf, clock);
                client.new_line = false;
                max_batch -= MAX_TIMESTAMP_LEN as isize;
            }

            let mut c = rest[batch];
            batch += 1;

            let oflags = client.attr.oflags;
            if oflags.contains(OutputFlags::ONLCR) && c == b'\n' {
                client.wbuf.put(b'\r');
                max_batch -= 1;
            }
            if oflags.contains(OutputFlags::OCRNL) && c == b'\r' {
                c = b'\n';
            }
            if oflags.contains(OutputFlags::ONLRET) && c == b'\r' {
                continue;
            }

            client.wbuf.put(c);
            client.new_line = c == b'\n';
            if client.new_line {
                last_nl = client.wbuf.head();
            }
        }
        rest = &rest[batch..];

        if let Some(mux) = out.as_deref_mut() {
            // An empty batch means the held-back line fills the ring
            let until = if client.line_buffering && batch > 0 {
                last_nl
            } else {
                client.wbuf.head()
            };

            if until != client.first_unwritten {
                do_output(client, until, mux);
                last_nl = until;
            }
        }
    }

    if out.is_none() {
        client.skip_unwritten();
        return None;
    }

    if client.line_buffering && client.wbuf.head() != client.first_unwritten {
        Some(Duration::from_millis(client.line_buffering_ms))
    } else {
        None
    }
}

/// Hand `[first_unwritten, until)` to the multiplexer
///
/// The range may wrap, then it goes out as two writes. Canonical mode
/// suppresses the flush.
pub fn do_output(client: &mut Client, until: Index, mux: &mut dyn OutputMux) {
    let label = client.label();
    let (first, second) = client.wbuf.slices(client.first_unwritten, until);

    if !first.is_empty() {
        mux.write(&label, first);
    }
    if !second.is_empty() {
        mux.write(&label, second);
    }
    if !client.attr.lflags.contains(LocalFlags::ICANON) {
        mux.flush(&label);
    }

    client.first_unwritten = until;
}

/// Flush timer fired: hand out everything, complete line or not
pub fn timeout_expired(client: &mut Client, mux: &mut dyn OutputMux) {
    let head = client.wbuf.head();
    if head != client.first_unwritten {
        do_output(client, head, mux);
    }
}

/// Apply input flags to bytes typed on a frontend
pub fn cooked_input(attr: &VconAttr, data: &[u8]) -> Vec<u8> {
    data.iter()
        .filter_map(|&c| {
            if c != b'\r' {
                Some(c)
            } else if attr.iflags.contains(InputFlags::IGNCR) {
                None
            } else if attr.iflags.contains(InputFlags::ICRNL) {
                Some(b'\n')
            } else {
                Some(c)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientId, ClientLabel, ClientParams, Key};
    use crate::config::Color;
    use crate::transport::VconTransport;
    use chrono::NaiveDate;
    use cons_broker::ManualClock;

    #[derive(Default)]
    struct Capture {
        out: Vec<u8>,
        writes: usize,
        flushes: usize,
    }

    impl OutputMux for Capture {
        fn write(&mut self, _client: &ClientLabel<'_>, data: &[u8]) {
            self.out.extend_from_slice(data);
            self.writes += 1;
        }

        fn flush(&mut self, _client: &ClientLabel<'_>) {
            self.flushes += 1;
        }
    }

    fn client(obuf: usize, line_buffering: bool, attr: VconAttr) -> Client {
        let mut c = Client::new(
            ClientId(1),
            ClientParams {
                tag: "test".to_string(),
                key: Key::nil(),
                color: Color::DEFAULT,
                idx: 0,
                input_buf_size: 64,
                output_buf_size: obuf,
                line_buffering,
                line_buffering_ms: 100,
            },
            Box::new(VconTransport::new()),
        );
        c.set_attr(attr);
        c
    }

    fn onlcr() -> VconAttr {
        VconAttr {
            oflags: OutputFlags::ONLCR,
            ..VconAttr::raw()
        }
    }

    fn buffered(c: &Client) -> Vec<u8> {
        let w = c.wbuf();
        let (a, b) = w.slices(w.tail(), w.head());
        [a, b].concat()
    }

    #[test]
    fn test_onlcr() {
        let clock = ManualClock::new();
        let mut c = client(512, false, onlcr());
        assert_eq!(cooked_write(&mut c, b"abc\n", None, &clock), None);
        assert_eq!(buffered(&c), b"abc\r\n");
    }

    #[test]
    fn test_tiny_output_ring_still_drains() {
        let clock = ManualClock::new();
        let mut c = client(16, false, onlcr());
        c.timestamp = true;
        assert_eq!(c.wbuf().capacity(), crate::client::MIN_WBUF_SIZE);

        let mut mux = Capture::default();
        assert_eq!(cooked_write(&mut c, b"ab\ncd\n", Some(&mut mux), &clock), None);
        assert_eq!(mux.out, b"[unknown] ab\r\n[unknown] cd\r\n");
        assert_eq!(c.unwritten(), 0);
    }

    #[test]
    fn test_cr_rules() {
        let clock = ManualClock::new();

        let mut c = client(512, false, VconAttr { oflags: OutputFlags::OCRNL, ..VconAttr::raw() });
        cooked_write(&mut c, b"a\rb", None, &clock);
        assert_eq!(buffered(&c), b"a\nb");

        let mut c = client(512, false, VconAttr { oflags: OutputFlags::ONLRET, ..VconAttr::raw() });
        cooked_write(&mut c, b"a\rb\r\n", None, &clock);
        assert_eq!(buffered(&c), b"ab\n");

        // OCRNL wins, the rewritten byte is no longer a carriage return
        let mut c = client(
            512,
            false,
            VconAttr {
                oflags: OutputFlags::OCRNL | OutputFlags::ONLRET,
                ..VconAttr::raw()
            },
        );
        cooked_write(&mut c, b"a\rb", None, &clock);
        assert_eq!(buffered(&c), b"a\nb");
    }

    #[test]
    fn test_line_defaults_do_not_double_cr() {
        let clock = ManualClock::new();
        let mut c = client(512, false, VconAttr::line_defaults());
        cooked_write(&mut c, b"one\r\ntwo\n", None, &clock);
        assert_eq!(buffered(&c), b"one\r\ntwo\r\n");
    }

    #[test]
    fn test_unbuffered_flushes_each_write() {
        let clock = ManualClock::new();
        let mut c = client(512, false, VconAttr::raw());
        let mut mux = Capture::default();

        assert_eq!(cooked_write(&mut c, b"partial", Some(&mut mux), &clock), None);
        assert_eq!(mux.out, b"partial");
        assert_eq!(mux.flushes, 1);
        assert_eq!(c.unwritten(), 0);
    }

    #[test]
    fn test_line_buffering_holds_partial_line() {
        let clock = ManualClock::new();
        let mut c = client(512, true, VconAttr::raw());
        let mut mux = Capture::default();

        let rearm = cooked_write(&mut c, b"partial", Some(&mut mux), &clock);
        assert_eq!(rearm, Some(Duration::from_millis(100)));
        assert!(mux.out.is_empty());

        timeout_expired(&mut c, &mut mux);
        assert_eq!(mux.out, b"partial");
        assert_eq!(c.unwritten(), 0);
    }

    #[test]
    fn test_line_buffering_flushes_complete_lines() {
        let clock = ManualClock::new();
        let mut c = client(512, true, VconAttr::raw());
        let mut mux = Capture::default();

        let rearm = cooked_write(&mut c, b"line1\nline2", Some(&mut mux), &clock);
        assert_eq!(mux.out, b"line1\n");
        assert!(rearm.is_some());
        assert_eq!(c.unwritten(), 5);

        let rearm = cooked_write(&mut c, b"\n", Some(&mut mux), &clock);
        assert_eq!(mux.out, b"line1\nline2\n");
        assert_eq!(rearm, None);
    }

    #[test]
    fn test_batches_never_overrun_unwritten_output() {
        let clock = ManualClock::new();
        let mut c = client(512, false, VconAttr::raw());
        let mut mux = Capture::default();

        let data: Vec<u8> = (0..3000u32).map(|i| b'a' + (i % 26) as u8).collect();
        cooked_write(&mut c, &data, Some(&mut mux), &clock);

        assert_eq!(mux.out, data);
        assert!(mux.flushes > 1);
    }

    #[test]
    fn test_long_partial_line_is_forced_out() {
        let clock = ManualClock::new();
        let mut c = client(512, true, VconAttr::raw());
        let mut mux = Capture::default();

        let mut data = vec![b'x'; 1500];
        data.extend_from_slice(b"\nyz");
        let rearm = cooked_write(&mut c, &data, Some(&mut mux), &clock);

        assert_eq!(mux.out, &data[..1501]);
        assert!(rearm.is_some());
        timeout_expired(&mut c, &mut mux);
        assert_eq!(mux.out, data);
    }

    #[test]
    fn test_canonical_mode_skips_flush() {
        let clock = ManualClock::new();
        let mut c = client(
            512,
            false,
            VconAttr {
                lflags: LocalFlags::ICANON,
                ..VconAttr::raw()
            },
        );
        let mut mux = Capture::default();

        cooked_write(&mut c, b"abc\n", Some(&mut mux), &clock);
        assert_eq!(mux.out, b"abc\n");
        assert_eq!(mux.flushes, 0);
    }

    #[test]
    fn test_wrapped_output_goes_out_in_two_writes() {
        let clock = ManualClock::new();
        let mut c = client(512, false, VconAttr::raw());
        let mut mux = Capture::default();

        cooked_write(&mut c, &[b'a'; 400], Some(&mut mux), &clock);
        let writes = mux.writes;
        cooked_write(&mut c, &[b'b'; 200], Some(&mut mux), &clock);

        assert_eq!(mux.writes, writes + 2);
        assert_eq!(mux.out.len(), 600);
        assert!(mux.out[400..].iter().all(|&b| b == b'b'));
    }

    #[test]
    fn test_timestamps() {
        let wall = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let clock = ManualClock::with_wall_time(wall);
        let mut c = client(512, false, VconAttr::raw());
        c.set_timestamp(true);

        cooked_write(&mut c, b"hi\nyo", None, &clock);
        assert_eq!(
            buffered(&c),
            b"[2024-03-01 12:00:00] hi\n[2024-03-01 12:00:00] yo"
        );
    }

    #[test]
    fn test_timestamp_without_wall_clock() {
        let clock = ManualClock::new();
        assert_eq!(format_timestamp(&clock), "[unknown] ");

        let mut c = client(512, false, VconAttr::raw());
        c.set_timestamp(true);
        cooked_write(&mut c, b"x", None, &clock);
        assert_eq!(buffered(&c), b"[unknown] x");
    }

    #[test]
    fn test_timestamp_fits_reservation() {
        let wall = NaiveDate::from_ymd_opt(2024, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        let clock = ManualClock::with_wall_time(wall);
        assert!(format_timestamp(&clock).len() <= MAX_TIMESTAMP_LEN);
    }

    #[test]
    fn test_hidden_client_keeps_nothing_pending() {
        let clock = ManualClock::new();
        let mut c = client(512, true, VconAttr::raw());
        assert_eq!(cooked_write(&mut c, b"no newline", None, &clock), None);
        assert_eq!(c.unwritten(), 0);
        assert_eq!(buffered(&c), b"no newline");
    }

    #[test]
    fn test_cooked_input() {
        let icrnl = VconAttr::line_defaults();
        assert_eq!(cooked_input(&icrnl, b"ls\r"), b"ls\n");

        let igncr = VconAttr {
            iflags: InputFlags::IGNCR | InputFlags::ICRNL,
            ..VconAttr::raw()
        };
        assert_eq!(cooked_input(&igncr, b"a\rb"), b"ab");
        assert_eq!(cooked_input(&VconAttr::raw(), b"a\rb"), b"a\rb");
    }
}
