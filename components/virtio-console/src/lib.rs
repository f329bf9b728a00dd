//! Virtio Console - Device side of a virtio console queue pair
//!
//! # Purpose
//! Implements the host end of a split-virtqueue console: the guest publishes
//! descriptor rings in memory it registered with the device, and the host
//! moves bytes between those rings and its own ring buffers.
//!
//! # Integration Points
//! - Depends on: `cons-ring` (host side byte queues)
//! - Provides to: console server (virtio frontends and virtio channels)
//!
//! # Architecture
//! ```text
//!            guest memory (registered regions)
//! ┌──────────────────────────────────────────────────┐
//! │ desc table │ avail ring │ used ring │ data bufs  │
//! └─────▲──────────────▲─────────────────────▲───────┘
//!       │ translate    │                     │
//! ┌─────┴──────────────┴─────────────────────┴───────┐
//! │               VirtioConsole device               │
//! │  receiveq (0): host ──► guest   (WRITE descs)    │
//! │  transmitq (1): guest ──► host  (read descs)     │
//! └───────────────┬──────────────────────────────────┘
//!                 │ GuestNotifier::trigger
//!                 ▼
//!           guest interrupt
//! ```
//!
//! # Protocol violations
//! A descriptor chain that points outside registered memory, loops, or has
//! the wrong direction marks the device `NEEDS_RESET`, disables both queues
//! and raises a configuration interrupt. The caller gets a [`VirtioError`]
//! and the guest has to reset the device.

pub mod console;
pub mod memory;
pub mod notify;
pub mod queue;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use console::{
    DeviceConfig, DeviceStatus, IrqStatus, TxSource, VirtioConsole, RECEIVEQ, TRANSMITQ,
};
pub use memory::{DriverMemory, GuestMemory};
pub use notify::{GuestNotifier, IrqCounter};
pub use queue::{DescChain, DescFlags, Descriptor, QueueConfig, QueueState, Virtqueue};

use thiserror::Error;

/// Virtio device id of a console
pub const VIRTIO_ID_CONSOLE: u32 = 3;

/// Vendor id reported in the device config
pub const VIRTIO_VENDOR_ID: u32 = 0x44;

/// Default maximum queue size
pub const DEFAULT_MAX_DESC: u16 = 0x100;

/// Errors that can occur in the virtio device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VirtioError {
    /// Queue number other than receiveq or transmitq
    #[error("Queue index {index} out of range")]
    QueueIndexOutOfRange { index: usize },

    /// Guest published an unusable queue layout
    #[error("Invalid configuration of queue {index}: {reason}")]
    InvalidQueueConfig { index: usize, reason: &'static str },

    /// Guest address range not covered by registered memory
    #[error("Guest memory fault at {addr:#x} (+{len:#x})")]
    RegionFault { addr: u64, len: usize },

    /// Too many memory regions registered
    #[error("Too many memory regions (max: {max})")]
    TooManyRegions { max: usize },

    /// Descriptor chain violates the queue protocol
    #[error("Malformed descriptor chain at head {head}: {reason}")]
    MalformedChain { head: u16, reason: &'static str },

    /// Queue is not in the ready state
    #[error("Queue {index} is not ready")]
    QueueNotReady { index: usize },
}

/// Result type for virtio operations
pub type Result<T> = core::result::Result<T, VirtioError>;
