//! Virtio console glue
//!
//! The virtio console device plays two roles:
//! - [`VirtioChannel`]: the transport of a client whose peer is a guest.
//!   The guest's transmit queue carries the client's output, pending client
//!   input is drained into the guest's receive queue.
//! - [`VirtioFrontend`]: a multiplexer frontend. Multiplexed output goes to
//!   the guest, what the guest transmits is operator input.
//!
//! Protocol violations have already reset the device by the time they
//! surface here; they are returned or logged, never fatal.

use std::any::Any;
use std::collections::VecDeque;

use log::warn;

use cons_ring::RingBuffer;
use cons_virtio::{GuestNotifier, VirtioConsole};

use crate::attr::VconAttr;
use crate::frontend::Frontend;
use crate::transport::{Transport, TransportKind, VconRead};
use crate::{ConsError, Result};

/// Virtio console transport of one client
#[derive(Debug)]
pub struct VirtioChannel {
    device: VirtioConsole,
}

impl VirtioChannel {
    pub fn new(max_desc: u16, notifier: Box<dyn GuestNotifier>) -> Self {
        Self {
            device: VirtioConsole::new(max_desc, notifier),
        }
    }

    pub fn device(&self) -> &VirtioConsole {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut VirtioConsole {
        &mut self.device
    }
}

impl Transport for VirtioChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Virtio
    }

    fn default_attr(&self) -> VconAttr {
        VconAttr::raw()
    }

    fn read(&mut self, _input: &mut RingBuffer, _buf: &mut [u8]) -> Result<VconRead> {
        Err(ConsError::Unsupported("read on a virtio channel"))
    }

    fn trigger(&mut self, input: &mut RingBuffer) -> Result<()> {
        self.device.transmit_from(input)?;
        Ok(())
    }

    /// Collect guest output, then hand the guest whatever input is pending
    fn kick(&mut self, input: &mut RingBuffer, output: &mut Vec<u8>) -> Result<()> {
        self.device.receive(&mut |data: &[u8]| output.extend_from_slice(data))?;
        self.device.transmit_from(input)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Virtio console device used as a multiplexer frontend
#[derive(Debug)]
pub struct VirtioFrontend {
    device: VirtioConsole,
    /// Output waiting for guest buffers, never overwritten
    pending: VecDeque<u8>,
}

impl VirtioFrontend {
    /// `buf_size` is the initial capacity of the pending queue
    pub fn new(device: VirtioConsole, buf_size: usize) -> Self {
        Self {
            device,
            pending: VecDeque::with_capacity(buf_size),
        }
    }

    pub fn device(&self) -> &VirtioConsole {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut VirtioConsole {
        &mut self.device
    }

    /// Bytes not yet delivered to the guest
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Frontend for VirtioFrontend {
    /// Queue `data` and deliver as much as the guest has room for
    ///
    /// All of `data` is accepted. What the guest has no room for stays
    /// queued in order until its next notification.
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.pending.extend(data);
        self.device.transmit_from(&mut self.pending)?;
        Ok(data.len())
    }

    fn check_input(&mut self, buf: &mut Vec<u8>) -> bool {
        if !self.device.has_guest_data() {
            return false;
        }
        match self.device.receive(&mut |data: &[u8]| buf.extend_from_slice(data)) {
            Ok(n) => n > 0,
            Err(e) => {
                warn!("virtio frontend: dropping guest input: {}", e);
                false
            }
        }
    }

    fn service(&mut self) -> Result<()> {
        self.device.transmit_from(&mut self.pending)?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
