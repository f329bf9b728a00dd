//! Console Broker - Runtime services consumed by the console server
//!
//! # Purpose
//! Provides the collaborators the console data path relies on but does not
//! implement itself: object registration, one-shot timeouts and a clock.
//!
//! # Integration Points
//! - Provides to: console server (client and frontend registration, line
//!   buffering flush timers, timestamp formatting)
//! - Depends on: nothing but the host clock
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Console Server (cons)          │
//! └──────┬──────────────┬──────────────┬────┘
//!        │ register     │ add_timeout  │ now / timestamp
//! ┌──────▼─────┐ ┌──────▼──────┐ ┌─────▼──────┐
//! │  Registry  │ │ TimerService│ │   Clock    │
//! └────────────┘ └─────────────┘ └────────────┘
//! ```
//!
//! Every service is a trait with one concrete implementation here, so the
//! server can be driven by a real event loop or by tests.

pub mod clock;
pub mod registry;
pub mod timeout;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use registry::{ObjectHandle, ObjectKind, ObjectRegistry, Registry};
pub use timeout::{TimeoutQueue, TimerService};

use thiserror::Error;

/// Errors that can occur in the broker services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Every registration slot is taken
    #[error("Out of object slots (capacity: {capacity})")]
    OutOfSlots { capacity: usize },

    /// Handle was never issued or is already unregistered
    #[error("Unknown object handle {0}")]
    UnknownHandle(ObjectHandle),
}

/// Result type for broker operations
pub type Result<T> = core::result::Result<T, BrokerError>;
