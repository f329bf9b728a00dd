//! Virtio console device
//!
//! One port, two queues. Bytes for the guest go into device-writable
//! buffers on the receive queue; bytes from the guest arrive in
//! device-readable buffers on the transmit queue.

use std::collections::VecDeque;
use std::fmt;

use bitflags::bitflags;
use log::{debug, warn};

use cons_ring::RingBuffer;

use crate::memory::{DriverMemory, GuestMemory};
use crate::notify::GuestNotifier;
use crate::queue::{DescChain, QueueConfig, QueueState, Virtqueue};
use crate::{Result, VirtioError, VIRTIO_ID_CONSOLE, VIRTIO_VENDOR_ID};

/// Queue carrying host to guest data
pub const RECEIVEQ: usize = 0;
/// Queue carrying guest to host data
pub const TRANSMITQ: usize = 1;

const NUM_QUEUES: usize = 2;
const MAX_MEM_REGIONS: usize = 8;

/// Host side byte queue the device transmits from
pub trait TxSource {
    /// Check if nothing is queued
    fn is_empty(&self) -> bool;

    /// Longest contiguous run at the front, non-empty unless the queue is
    fn front_run(&self) -> &[u8];

    /// Drop `n` bytes from the front
    fn consume(&mut self, n: usize);
}

impl TxSource for RingBuffer {
    fn is_empty(&self) -> bool {
        RingBuffer::is_empty(self)
    }

    fn front_run(&self) -> &[u8] {
        self.get(0)
    }

    fn consume(&mut self, n: usize) {
        self.clear(n);
    }
}

impl TxSource for VecDeque<u8> {
    fn is_empty(&self) -> bool {
        VecDeque::is_empty(self)
    }

    fn front_run(&self) -> &[u8] {
        let (front, back) = self.as_slices();
        if front.is_empty() {
            back
        } else {
            front
        }
    }

    fn consume(&mut self, n: usize) {
        self.drain(..n);
    }
}

bitflags! {
    /// Device status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const NEEDS_RESET = 64;
        const FAILED = 128;
    }
}

bitflags! {
    /// Interrupt status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IrqStatus: u32 {
        /// Used ring was updated
        const VRING = 1;
        /// Device configuration changed
        const CONFIG = 2;
    }
}

/// Device configuration space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub vendor: u32,
    pub device_id: u32,
    pub num_queues: u32,
    pub status: DeviceStatus,
    pub irq_status: IrqStatus,
    /// Console width, zero if unknown
    pub cols: u16,
    /// Console height, zero if unknown
    pub rows: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor: VIRTIO_VENDOR_ID,
            device_id: VIRTIO_ID_CONSOLE,
            num_queues: NUM_QUEUES as u32,
            status: DeviceStatus::empty(),
            irq_status: IrqStatus::empty(),
            cols: 0,
            rows: 0,
        }
    }
}

/// Host side of a virtio console
pub struct VirtioConsole {
    config: DeviceConfig,
    queues: [Virtqueue; NUM_QUEUES],
    memory: DriverMemory,
    notifier: Box<dyn GuestNotifier>,
}

impl VirtioConsole {
    /// Create a device whose queues accept up to `max_desc` descriptors
    pub fn new(max_desc: u16, notifier: Box<dyn GuestNotifier>) -> Self {
        Self {
            config: DeviceConfig::default(),
            queues: [
                Virtqueue::new(RECEIVEQ, max_desc),
                Virtqueue::new(TRANSMITQ, max_desc),
            ],
            memory: DriverMemory::new(MAX_MEM_REGIONS),
            notifier,
        }
    }

    /// Device configuration space
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Device status
    pub fn status(&self) -> DeviceStatus {
        self.config.status
    }

    /// Pending interrupt causes
    pub fn irq_status(&self) -> IrqStatus {
        self.config.irq_status
    }

    /// Memory registered by the guest driver
    pub fn memory(&self) -> &DriverMemory {
        &self.memory
    }

    /// Mutable access to registered memory
    pub fn memory_mut(&mut self) -> &mut DriverMemory {
        &mut self.memory
    }

    /// Guest registers a memory region
    pub fn register_memory(&mut self, guest_base: u64, size: usize) -> Result<()> {
        self.memory.add_region(guest_base, size)
    }

    /// Queue by number
    pub fn queue(&self, index: usize) -> Result<&Virtqueue> {
        self.queues
            .get(index)
            .ok_or(VirtioError::QueueIndexOutOfRange { index })
    }

    /// Guest writes the status register
    ///
    /// Writing zero resets the device.
    pub fn set_status(&mut self, status: DeviceStatus) {
        if status.is_empty() {
            self.reset();
            return;
        }
        debug!("virtio console status {:?}", status);
        self.config.status = status;
    }

    /// Check if the guest finished initialisation and both queues run
    pub fn is_ready(&self) -> bool {
        self.config.status.contains(DeviceStatus::DRIVER_OK)
            && !self.config.status.contains(DeviceStatus::NEEDS_RESET)
            && self.queues.iter().all(Virtqueue::is_ready)
    }

    /// Reset to the initial state
    ///
    /// Disables both queues, clears status and drops registered memory.
    pub fn reset(&mut self) {
        debug!("virtio console reset");
        for q in self.queues.iter_mut() {
            q.disable();
        }
        self.config.status = DeviceStatus::empty();
        self.config.irq_status = IrqStatus::empty();
        self.memory.clear();
    }

    /// Guest publishes the layout of a queue
    pub fn configure_queue(&mut self, index: usize, config: QueueConfig) -> Result<()> {
        let q = self
            .queues
            .get_mut(index)
            .ok_or(VirtioError::QueueIndexOutOfRange { index })?;
        q.set_config(config);
        Ok(())
    }

    /// Validate a published queue layout and enable the queue
    ///
    /// # Errors
    /// - [`VirtioError::QueueIndexOutOfRange`] for any queue but 0 and 1
    /// - [`VirtioError::InvalidQueueConfig`] if the layout is unusable
    pub fn reconfig_queue(&mut self, index: usize) -> Result<()> {
        let q = self
            .queues
            .get_mut(index)
            .ok_or(VirtioError::QueueIndexOutOfRange { index })?;
        q.setup(&self.memory)
    }

    /// Verify both queues are ready after the guest set `DRIVER_OK`
    ///
    /// A device with a queue still unconfigured is reset.
    pub fn check_queues(&mut self) -> bool {
        if self.queues.iter().all(Virtqueue::is_ready) {
            return true;
        }
        let states: Vec<QueueState> = self.queues.iter().map(Virtqueue::state).collect();
        warn!("virtio console queues not ready {:?}, resetting", states);
        self.reset();
        false
    }

    /// Raise a used-ring interrupt for `index` unless the guest suppressed it
    pub fn notify_queue(&mut self, index: usize) -> Result<()> {
        let q = self.queue(index)?;
        if q.no_notify_guest(&self.memory)? {
            return Ok(());
        }
        self.config.irq_status.insert(IrqStatus::VRING);
        self.notifier.trigger();
        Ok(())
    }

    /// Raise a configuration-change interrupt
    pub fn trigger_config_irq(&mut self) {
        self.config.irq_status.insert(IrqStatus::CONFIG);
        self.notifier.trigger();
    }

    /// Mark the device broken after a protocol violation
    fn fail(&mut self, err: &VirtioError) {
        warn!("virtio console protocol violation: {}", err);
        for q in self.queues.iter_mut() {
            q.disable();
        }
        self.config.status.insert(DeviceStatus::NEEDS_RESET);
        self.trigger_config_irq();
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.fail(err);
        }
        result
    }

    /// Check if the guest has sent data that was not received yet
    pub fn has_guest_data(&self) -> bool {
        let q = &self.queues[TRANSMITQ];
        q.is_ready() && q.has_pending(&self.memory).unwrap_or(false)
    }

    /// Move bytes from `src` into guest receive buffers
    ///
    /// Bytes are taken one contiguous run at a time and consumed from `src`
    /// once copied, so whatever does not fit stays queued. Ring breaks are
    /// not transmitted. Does nothing while the receive queue is not ready.
    ///
    /// # Returns
    /// Number of bytes handed to the guest.
    pub fn transmit_from<S: TxSource + ?Sized>(&mut self, src: &mut S) -> Result<usize> {
        if !self.queues[RECEIVEQ].is_ready() {
            return Ok(0);
        }
        let result = self.transmit_inner(src);
        self.check(result)
    }

    fn transmit_inner<S: TxSource + ?Sized>(&mut self, src: &mut S) -> Result<usize> {
        let mut total = 0;
        let mut used = false;

        while !src.is_empty() {
            let Some(chain) = self.queues[RECEIVEQ].pop(&self.memory)? else {
                break;
            };

            let written = self.fill_chain(&chain, src)?;
            self.queues[RECEIVEQ].add_used(&mut self.memory, chain.head, written as u32)?;
            total += written;
            used = true;
        }

        if used {
            self.notify_queue(RECEIVEQ)?;
        }
        Ok(total)
    }

    fn fill_chain<S: TxSource + ?Sized>(&mut self, chain: &DescChain, src: &mut S) -> Result<usize> {
        let mut written = 0;
        for desc in &chain.descs {
            if !desc.is_write_only() {
                return Err(VirtioError::MalformedChain {
                    head: chain.head,
                    reason: "receive buffer is not device writable",
                });
            }

            let mut off = 0usize;
            while off < desc.len as usize && !src.is_empty() {
                let run = src.front_run();
                let n = run.len().min(desc.len as usize - off);
                let dst = self.memory.translate_mut(desc.addr + off as u64, n)?;
                dst.copy_from_slice(&run[..n]);
                src.consume(n);
                off += n;
            }
            written += off;
        }
        Ok(written)
    }

    /// Deliver guest transmit buffers to `sink`
    ///
    /// `sink` is called once per descriptor with the bytes the guest wrote.
    /// Every chain is returned to the guest with a used length of zero.
    ///
    /// # Returns
    /// Number of bytes received.
    pub fn receive(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<usize> {
        if !self.queues[TRANSMITQ].is_ready() {
            return Ok(0);
        }
        let result = self.receive_inner(sink);
        self.check(result)
    }

    fn receive_inner(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<usize> {
        let mut total = 0;
        let mut used = false;

        while let Some(chain) = self.queues[TRANSMITQ].pop(&self.memory)? {
            for desc in &chain.descs {
                if desc.is_write_only() {
                    return Err(VirtioError::MalformedChain {
                        head: chain.head,
                        reason: "transmit buffer is device writable",
                    });
                }
                let data = self.memory.translate(desc.addr, desc.len as usize)?;
                sink(data);
                total += data.len();
            }
            self.queues[TRANSMITQ].add_used(&mut self.memory, chain.head, 0)?;
            used = true;
        }

        if used {
            self.notify_queue(TRANSMITQ)?;
        }
        Ok(total)
    }
}

impl fmt::Debug for VirtioConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioConsole")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .field("regions", &self.memory.num_regions())
            .finish()
    }
}
