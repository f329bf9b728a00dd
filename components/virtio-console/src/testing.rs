//! Simulated guest driver
//!
//! Plays the guest side of the queue protocol against a [`VirtioConsole`]:
//! registers one memory region, lays out both queues in it, and offers
//! buffers the way a guest kernel driver would. Only built for tests and
//! with the `testing` feature.

use crate::console::{DeviceStatus, VirtioConsole, RECEIVEQ, TRANSMITQ};
use crate::memory::GuestMemory;
use crate::queue::{DescFlags, Descriptor, QueueConfig};
use crate::{Result, VirtioError};

/// Guest address of the simulated driver memory
pub const GUEST_BASE: u64 = 0x4000_0000;
/// Size of the simulated driver memory
pub const GUEST_MEM_SIZE: usize = 0x10000;

#[derive(Debug, Default, Clone, Copy)]
struct GuestRing {
    config: QueueConfig,
    next_desc: u16,
    avail_idx: u16,
    used_seen: u16,
}

/// Guest end of a virtio console
#[derive(Debug)]
pub struct GuestDriver {
    cursor: u64,
    rings: [GuestRing; 2],
}

impl GuestDriver {
    /// Run the guest initialisation sequence with `num` descriptors per queue
    pub fn start(dev: &mut VirtioConsole, num: u16) -> Result<Self> {
        dev.set_status(DeviceStatus::ACKNOWLEDGE);
        dev.set_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);
        dev.register_memory(GUEST_BASE, GUEST_MEM_SIZE)?;

        let mut driver = Self {
            cursor: GUEST_BASE,
            rings: [GuestRing::default(); 2],
        };

        for index in [RECEIVEQ, TRANSMITQ] {
            let mut config = QueueConfig {
                num,
                ..QueueConfig::default()
            };
            config.desc_addr = driver.alloc(config.desc_table_size(), 16)?;
            config.avail_addr = driver.alloc(config.avail_ring_size(), 2)?;
            config.used_addr = driver.alloc(config.used_ring_size(), 4)?;

            dev.configure_queue(index, config)?;
            dev.reconfig_queue(index)?;
            driver.rings[index].config = config;
        }

        dev.set_status(
            DeviceStatus::ACKNOWLEDGE
                | DeviceStatus::DRIVER
                | DeviceStatus::FEATURES_OK
                | DeviceStatus::DRIVER_OK,
        );
        dev.check_queues();
        Ok(driver)
    }

    fn alloc(&mut self, len: usize, align: u64) -> Result<u64> {
        let addr = self.cursor.next_multiple_of(align);
        let end = addr + len as u64;
        if end > GUEST_BASE + GUEST_MEM_SIZE as u64 {
            return Err(VirtioError::RegionFault { addr, len });
        }
        self.cursor = end;
        Ok(addr)
    }

    fn ring(&mut self, queue: usize) -> Result<&mut GuestRing> {
        self.rings
            .get_mut(queue)
            .ok_or(VirtioError::QueueIndexOutOfRange { index: queue })
    }

    /// Offer one device-writable buffer of `len` bytes
    ///
    /// # Returns
    /// Guest address of the buffer.
    pub fn offer_writable(&mut self, dev: &mut VirtioConsole, queue: usize, len: usize) -> Result<u64> {
        let addr = self.alloc(len, 1)?;
        self.offer_raw(dev, queue, &[(addr, len as u32, DescFlags::WRITE)])?;
        Ok(addr)
    }

    /// Offer one device-readable buffer holding `data`
    pub fn offer_readable(&mut self, dev: &mut VirtioConsole, queue: usize, data: &[u8]) -> Result<u64> {
        let addr = self.alloc(data.len(), 1)?;
        dev.memory_mut()
            .translate_mut(addr, data.len())?
            .copy_from_slice(data);
        self.offer_raw(dev, queue, &[(addr, data.len() as u32, DescFlags::empty())])?;
        Ok(addr)
    }

    /// Offer a chain of arbitrary descriptors
    ///
    /// `NEXT` links are filled in. Descriptor slots are handed out round
    /// robin.
    ///
    /// # Returns
    /// Head descriptor index.
    pub fn offer_raw(
        &mut self,
        dev: &mut VirtioConsole,
        queue: usize,
        bufs: &[(u64, u32, DescFlags)],
    ) -> Result<u16> {
        let ring = *self.ring(queue)?;
        let num = ring.config.num;
        let mem = dev.memory_mut();

        let head = ring.next_desc % num;
        let mut idx = head;
        for (i, &(addr, len, flags)) in bufs.iter().enumerate() {
            let next = (idx + 1) % num;
            let flags = if i + 1 < bufs.len() {
                flags | DescFlags::NEXT
            } else {
                flags
            };

            let entry = ring.config.desc_addr + Descriptor::SIZE * u64::from(idx);
            mem.write_u64(entry, addr)?;
            mem.write_u32(entry + 8, len)?;
            mem.write_u16(entry + 12, flags.bits())?;
            mem.write_u16(entry + 14, next)?;
            idx = next;
        }

        let slot = u64::from(ring.avail_idx % num);
        mem.write_u16(ring.config.avail_addr + 4 + 2 * slot, head)?;
        let avail_idx = ring.avail_idx.wrapping_add(1);
        mem.write_u16(ring.config.avail_addr + 2, avail_idx)?;

        let r = self.ring(queue)?;
        r.next_desc = idx;
        r.avail_idx = avail_idx;
        Ok(head)
    }

    /// Used ring entries (id, len) the device added since the last call
    pub fn used(&mut self, dev: &VirtioConsole, queue: usize) -> Result<Vec<(u32, u32)>> {
        let ring = *self.ring(queue)?;
        let mem = dev.memory();
        let used_idx = mem.read_u16(ring.config.used_addr + 2)?;

        let mut entries = Vec::new();
        let mut seen = ring.used_seen;
        while seen != used_idx {
            let elem = ring.config.used_addr + 4 + 8 * u64::from(seen % ring.config.num);
            entries.push((mem.read_u32(elem)?, mem.read_u32(elem + 4)?));
            seen = seen.wrapping_add(1);
        }

        self.ring(queue)?.used_seen = seen;
        Ok(entries)
    }

    /// Copy bytes out of guest memory
    pub fn read_bytes(&self, dev: &VirtioConsole, addr: u64, len: usize) -> Result<Vec<u8>> {
        Ok(dev.memory().translate(addr, len)?.to_vec())
    }

    /// Set or clear the available ring `NO_INTERRUPT` flag
    pub fn set_no_interrupt(&mut self, dev: &mut VirtioConsole, queue: usize, on: bool) -> Result<()> {
        let ring = *self.ring(queue)?;
        dev.memory_mut()
            .write_u16(ring.config.avail_addr, u16::from(on))
    }
}
