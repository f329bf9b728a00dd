//! Channel transports
//!
//! A transport is how a client talks to the peer on the other end of its
//! channel. The direct-line transport lets the peer pull input with
//! [`Transport::read`] and notifies it through a counted trigger; the
//! virtio transport ([`crate::virtio::VirtioChannel`]) moves bytes through
//! guest descriptor rings instead.

use std::any::Any;
use std::fmt;

use bitflags::bitflags;

use cons_ring::RingBuffer;

use crate::attr::VconAttr;
use crate::{ConsError, Result};

/// Transport variant of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Direct line, the peer calls read/write
    Vcon,
    /// Virtio console device
    Virtio,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Vcon => write!(f, "vcon"),
            TransportKind::Virtio => write!(f, "virtio"),
        }
    }
}

bitflags! {
    /// Status bits of a read
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadStatus: u32 {
        /// Input buffer is drained
        const DONE = 1 << 0;
        /// A break preceded the returned data
        const BREAK = 1 << 1;
    }
}

/// Outcome of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VconRead {
    /// Bytes copied into the caller's buffer
    pub len: usize,
    pub status: ReadStatus,
}

impl VconRead {
    /// More input is waiting after this read
    pub fn more_pending(&self) -> bool {
        !self.status.intersects(ReadStatus::DONE | ReadStatus::BREAK)
    }
}

/// Channel peer interface of a client
pub trait Transport {
    fn kind(&self) -> TransportKind;

    /// Attributes a new client on this transport starts with
    fn default_attr(&self) -> VconAttr;

    /// Peer pulls input from the client's input ring
    fn read(&mut self, input: &mut RingBuffer, buf: &mut [u8]) -> Result<VconRead>;

    /// Input arrived while the input ring was empty
    fn trigger(&mut self, input: &mut RingBuffer) -> Result<()>;

    /// Peer signalled the server
    ///
    /// Bytes the peer produced for the client's output are appended to
    /// `output`; they still have to go through the line discipline.
    fn kick(&mut self, input: &mut RingBuffer, output: &mut Vec<u8>) -> Result<()>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Direct-line transport
#[derive(Debug, Default)]
pub struct VconTransport {
    /// Notifications raised towards the peer
    triggers: u64,
}

impl VconTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of input notifications sent to the peer
    pub fn triggers(&self) -> u64 {
        self.triggers
    }
}

impl Transport for VconTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Vcon
    }

    fn default_attr(&self) -> VconAttr {
        VconAttr::line_defaults()
    }

    /// Drain input into `buf`
    ///
    /// Copies contiguous runs until `buf` is full, the input is drained, or
    /// the next break marker is reached. A break marker at the very start
    /// is consumed and reported as [`ReadStatus::BREAK`].
    fn read(&mut self, input: &mut RingBuffer, buf: &mut [u8]) -> Result<VconRead> {
        let mut status = ReadStatus::empty();
        if input.is_next_break(0) {
            status |= ReadStatus::BREAK;
            input.clear_next_break();
        }

        let mut n = 0;
        let mut hit_break = false;
        while n < buf.len() {
            let run = input.get(0);
            if run.is_empty() {
                break;
            }

            let take = run.len().min(buf.len() - n);
            let mut i = 0;
            while i < take {
                if input.is_next_break(i) {
                    hit_break = true;
                    break;
                }
                i += 1;
            }

            buf[n..n + i].copy_from_slice(&run[..i]);
            input.clear(i);
            n += i;
            if hit_break {
                break;
            }
        }

        if !hit_break && input.is_empty() {
            status |= ReadStatus::DONE;
        }
        Ok(VconRead { len: n, status })
    }

    fn trigger(&mut self, _input: &mut RingBuffer) -> Result<()> {
        self.triggers += 1;
        Ok(())
    }

    fn kick(&mut self, _input: &mut RingBuffer, _output: &mut Vec<u8>) -> Result<()> {
        Err(ConsError::Unsupported("kick on a direct-line channel"))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
