//! Split virtqueue
//!
//! Device view of one virtqueue. The guest owns the descriptor table and
//! the available ring; the device owns the used ring.
//!
//! ```text
//! descriptor (16 bytes):  addr u64 | len u32 | flags u16 | next u16
//! avail ring:             flags u16 | idx u16 | ring[num] u16
//! used ring:              flags u16 | idx u16 | ring[num] { id u32, len u32 }
//! ```
//!
//! A queue starts `Disabled`, moves to `Configuring` once the guest has
//! published its ring addresses, and to `Ready` after the device validated
//! them.

use bitflags::bitflags;
use log::{debug, trace};
use static_assertions::const_assert_eq;

use crate::memory::GuestMemory;
use crate::{Result, VirtioError};

bitflags! {
    /// Descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Chain continues at `next`
        const NEXT = 1;
        /// Buffer is device writable
        const WRITE = 2;
        /// Buffer holds an indirect descriptor table
        const INDIRECT = 4;
    }
}

bitflags! {
    /// Available ring flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvailFlags: u16 {
        /// Guest does not want an interrupt when buffers are used
        const NO_INTERRUPT = 1;
    }
}

/// One entry of the descriptor table
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Guest address of the buffer
    pub addr: u64,
    /// Buffer length in bytes
    pub len: u32,
    /// Descriptor flags
    pub flags: DescFlags,
    /// Next descriptor if `NEXT` is set
    pub next: u16,
}

const_assert_eq!(core::mem::size_of::<Descriptor>(), Descriptor::SIZE as usize);

impl Descriptor {
    /// Size of a descriptor in the table
    pub const SIZE: u64 = 16;

    /// Check if the buffer is device writable
    pub fn is_write_only(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }

    fn has_next(&self) -> bool {
        self.flags.contains(DescFlags::NEXT)
    }

    fn read_from<M: GuestMemory + ?Sized>(mem: &M, addr: u64) -> Result<Self> {
        Ok(Self {
            addr: mem.read_u64(addr)?,
            len: mem.read_u32(addr + 8)?,
            flags: DescFlags::from_bits_retain(mem.read_u16(addr + 12)?),
            next: mem.read_u16(addr + 14)?,
        })
    }
}

/// Descriptor chain taken from the available ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescChain {
    /// Head descriptor index, returned in the used ring
    pub head: u16,
    /// Descriptors in chain order
    pub descs: Vec<Descriptor>,
}

impl DescChain {
    /// Total buffer length of the chain
    pub fn total_len(&self) -> usize {
        self.descs.iter().map(|d| d.len as usize).sum()
    }
}

/// Queue layout published by the guest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of descriptors
    pub num: u16,
    /// Guest address of the descriptor table
    pub desc_addr: u64,
    /// Guest address of the available ring
    pub avail_addr: u64,
    /// Guest address of the used ring
    pub used_addr: u64,
}

impl QueueConfig {
    /// Bytes taken by the descriptor table
    pub fn desc_table_size(&self) -> usize {
        Descriptor::SIZE as usize * self.num as usize
    }

    /// Bytes taken by the available ring
    pub fn avail_ring_size(&self) -> usize {
        4 + 2 * self.num as usize
    }

    /// Bytes taken by the used ring
    pub fn used_ring_size(&self) -> usize {
        4 + 8 * self.num as usize
    }
}

/// Queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Not usable
    Disabled,
    /// Guest published a layout, not yet validated
    Configuring,
    /// Validated and in use
    Ready,
}

/// Device side of one split virtqueue
#[derive(Debug)]
pub struct Virtqueue {
    index: usize,
    state: QueueState,
    num_max: u16,
    config: QueueConfig,
    /// Next available ring slot the device will read
    last_avail: u16,
    /// Next used ring slot the device will write
    used_idx: u16,
}

impl Virtqueue {
    /// Create a disabled queue advertising `num_max` descriptors
    pub fn new(index: usize, num_max: u16) -> Self {
        Self {
            index,
            state: QueueState::Disabled,
            num_max,
            config: QueueConfig::default(),
            last_avail: 0,
            used_idx: 0,
        }
    }

    /// Queue number
    pub fn index(&self) -> usize {
        self.index
    }

    /// Largest queue size the device accepts
    pub fn num_max(&self) -> u16 {
        self.num_max
    }

    /// Current lifecycle state
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Check if the queue is ready
    pub fn is_ready(&self) -> bool {
        self.state == QueueState::Ready
    }

    /// Layout published by the guest
    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Guest publishes a queue layout
    pub fn set_config(&mut self, config: QueueConfig) {
        self.config = config;
        self.state = QueueState::Configuring;
    }

    /// Disable the queue and forget its layout
    pub fn disable(&mut self) {
        self.state = QueueState::Disabled;
        self.config = QueueConfig::default();
        self.last_avail = 0;
        self.used_idx = 0;
    }

    /// Validate the published layout and make the queue ready
    ///
    /// # Errors
    /// Returns [`VirtioError::InvalidQueueConfig`] if no layout was
    /// published, the size is not a power of two up to `num_max`, a ring is
    /// misaligned, or a ring is not backed by registered memory. The queue is
    /// disabled on error.
    pub fn setup<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> Result<()> {
        let result = self.validate(mem);
        match result {
            Ok(()) => {
                self.state = QueueState::Ready;
                self.last_avail = 0;
                self.used_idx = 0;
                debug!(
                    "queue {} ready: num={} desc={:#x} avail={:#x} used={:#x}",
                    self.index,
                    self.config.num,
                    self.config.desc_addr,
                    self.config.avail_addr,
                    self.config.used_addr
                );
            }
            Err(_) => self.disable(),
        }
        result
    }

    fn validate<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<()> {
        let invalid = |reason| VirtioError::InvalidQueueConfig {
            index: self.index,
            reason,
        };

        if self.state == QueueState::Disabled {
            return Err(invalid("no layout published"));
        }

        let cfg = &self.config;
        if cfg.num == 0 || !cfg.num.is_power_of_two() {
            return Err(invalid("size is not a power of two"));
        }
        if cfg.num > self.num_max {
            return Err(invalid("size exceeds maximum"));
        }
        if cfg.desc_addr % 16 != 0 || cfg.avail_addr % 2 != 0 || cfg.used_addr % 4 != 0 {
            return Err(invalid("misaligned ring"));
        }

        let rings = [
            (cfg.desc_addr, cfg.desc_table_size()),
            (cfg.avail_addr, cfg.avail_ring_size()),
            (cfg.used_addr, cfg.used_ring_size()),
        ];
        for (addr, len) in rings {
            mem.translate(addr, len)
                .map_err(|_| invalid("ring outside registered memory"))?;
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(VirtioError::QueueNotReady { index: self.index })
        }
    }

    /// Check whether the guest suppressed used-buffer interrupts
    pub fn no_notify_guest<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<bool> {
        self.ensure_ready()?;
        let flags = AvailFlags::from_bits_retain(mem.read_u16(self.config.avail_addr)?);
        Ok(flags.contains(AvailFlags::NO_INTERRUPT))
    }

    /// Check if the guest made buffers available that were not taken yet
    pub fn has_pending<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<bool> {
        self.ensure_ready()?;
        Ok(self.avail_idx(mem)? != self.last_avail)
    }

    fn avail_idx<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<u16> {
        mem.read_u16(self.config.avail_addr + 2)
    }

    /// Take the next available descriptor chain
    ///
    /// Every descriptor is read and its buffer checked against registered
    /// memory before the chain is returned.
    ///
    /// # Returns
    /// `None` if the guest has not made any new buffer available.
    pub fn pop<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> Result<Option<DescChain>> {
        self.ensure_ready()?;

        let avail_idx = self.avail_idx(mem)?;
        if avail_idx == self.last_avail {
            return Ok(None);
        }

        let num = self.config.num;
        if avail_idx.wrapping_sub(self.last_avail) > num {
            return Err(VirtioError::MalformedChain {
                head: avail_idx,
                reason: "available index ahead of ring",
            });
        }

        let slot = u64::from(self.last_avail % num);
        let head = mem.read_u16(self.config.avail_addr + 4 + 2 * slot)?;
        self.last_avail = self.last_avail.wrapping_add(1);

        let chain = self.walk_chain(mem, head)?;
        trace!(
            "queue {}: chain head={} descs={} bytes={}",
            self.index,
            head,
            chain.descs.len(),
            chain.total_len()
        );
        Ok(Some(chain))
    }

    fn walk_chain<M: GuestMemory + ?Sized>(&self, mem: &M, head: u16) -> Result<DescChain> {
        let malformed = |reason| VirtioError::MalformedChain { head, reason };
        let num = self.config.num;

        let mut descs = Vec::new();
        let mut idx = head;
        loop {
            if idx >= num {
                return Err(malformed("descriptor index out of range"));
            }
            if descs.len() >= num as usize {
                return Err(malformed("descriptor loop"));
            }

            let desc =
                Descriptor::read_from(mem, self.config.desc_addr + Descriptor::SIZE * u64::from(idx))?;
            if desc.flags.contains(DescFlags::INDIRECT) {
                return Err(malformed("indirect descriptors not supported"));
            }
            mem.translate(desc.addr, desc.len as usize)?;

            descs.push(desc);
            if !desc.has_next() {
                break;
            }
            idx = desc.next;
        }

        Ok(DescChain { head, descs })
    }

    /// Return a chain to the guest through the used ring
    ///
    /// `len` is the number of bytes the device wrote into the chain.
    pub fn add_used<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, head: u16, len: u32) -> Result<()> {
        self.ensure_ready()?;

        let slot = u64::from(self.used_idx % self.config.num);
        let elem = self.config.used_addr + 4 + 8 * slot;
        mem.write_u32(elem, u32::from(head))?;
        mem.write_u32(elem + 4, len)?;

        self.used_idx = self.used_idx.wrapping_add(1);
        mem.write_u16(self.config.used_addr + 2, self.used_idx)
    }
}
