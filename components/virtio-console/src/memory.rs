//! Guest memory
//!
//! The guest registers memory regions with the device before it publishes
//! any queue. Every guest address the device touches, queue rings as well
//! as data buffers, goes through [`GuestMemory`] and is checked against
//! those regions.

use log::debug;

use crate::{Result, VirtioError};

/// Address translation collaborator
pub trait GuestMemory {
    /// Borrow `len` bytes at guest address `addr`
    ///
    /// # Errors
    /// Returns [`VirtioError::RegionFault`] unless the whole range lies in
    /// one registered region.
    fn translate(&self, addr: u64, len: usize) -> Result<&[u8]>;

    /// Mutable variant of [`GuestMemory::translate`]
    fn translate_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8]>;

    /// Read a little-endian u16
    fn read_u16(&self, addr: u64) -> Result<u16> {
        let bytes = self.translate(addr, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a little-endian u32
    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.translate(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a little-endian u64
    fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.translate(addr, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Write a little-endian u16
    fn write_u16(&mut self, addr: u64, value: u16) -> Result<()> {
        self.translate_mut(addr, 2)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian u32
    fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.translate_mut(addr, 4)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a little-endian u64
    fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.translate_mut(addr, 8)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// One registered region
struct MemRegion {
    /// Guest physical base address
    guest_base: u64,
    /// Backing storage
    data: Box<[u8]>,
}

impl MemRegion {
    /// Offset of `[addr, addr + len)` inside this region
    fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let start = addr.checked_sub(self.guest_base)?;
        let end = start.checked_add(len as u64)?;
        if end <= self.data.len() as u64 {
            Some(start as usize)
        } else {
            None
        }
    }

    fn overlaps(&self, base: u64, size: usize) -> bool {
        let end = base.saturating_add(size as u64);
        let own_end = self.guest_base + self.data.len() as u64;
        base < own_end && self.guest_base < end
    }
}

/// Memory the guest driver registered with the device
pub struct DriverMemory {
    regions: Vec<MemRegion>,
    max_regions: usize,
}

impl DriverMemory {
    /// Create an empty region table allowing `max_regions` entries
    pub fn new(max_regions: usize) -> Self {
        Self {
            regions: Vec::new(),
            max_regions,
        }
    }

    /// Register a zero-filled region of `size` bytes at `guest_base`
    ///
    /// # Errors
    /// - [`VirtioError::TooManyRegions`] if the table is full
    /// - [`VirtioError::RegionFault`] if the region is empty, wraps the
    ///   address space or overlaps an existing one
    pub fn add_region(&mut self, guest_base: u64, size: usize) -> Result<()> {
        if self.regions.len() >= self.max_regions {
            return Err(VirtioError::TooManyRegions {
                max: self.max_regions,
            });
        }

        let fault = VirtioError::RegionFault {
            addr: guest_base,
            len: size,
        };
        if size == 0 || guest_base.checked_add(size as u64).is_none() {
            return Err(fault);
        }
        if self.regions.iter().any(|r| r.overlaps(guest_base, size)) {
            return Err(fault);
        }

        debug!("registered guest memory {:#x} (+{:#x})", guest_base, size);
        self.regions.push(MemRegion {
            guest_base,
            data: vec![0u8; size].into_boxed_slice(),
        });
        Ok(())
    }

    /// Drop every registered region
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Number of registered regions
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }
}

impl GuestMemory for DriverMemory {
    fn translate(&self, addr: u64, len: usize) -> Result<&[u8]> {
        self.regions
            .iter()
            .find_map(|r| r.offset_of(addr, len).map(|off| &r.data[off..off + len]))
            .ok_or(VirtioError::RegionFault { addr, len })
    }

    fn translate_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8]> {
        for region in self.regions.iter_mut() {
            if let Some(off) = region.offset_of(addr, len) {
                return Ok(&mut region.data[off..off + len]);
            }
        }
        Err(VirtioError::RegionFault { addr, len })
    }
}
