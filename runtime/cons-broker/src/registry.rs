//! Object Registry
//!
//! Hands out handles for server objects (the factory itself, console
//! channels, frontends). Handles are what external requesters address; the
//! registry does not own the objects behind them.
//!
//! The number of slots is fixed at construction. Running out of slots is
//! the resource-exhaustion case of channel creation.

use core::fmt;

use log::debug;

use crate::{BrokerError, Result};

/// Registration collaborator
///
/// Implemented by [`ObjectRegistry`]; the console server only talks to this
/// trait.
pub trait Registry {
    /// Register an object and return its handle
    ///
    /// # Errors
    /// Returns [`BrokerError::OutOfSlots`] when no slot is free.
    fn register(&mut self, label: &str, kind: ObjectKind) -> Result<ObjectHandle>;

    /// Release a handle
    ///
    /// # Errors
    /// Returns [`BrokerError::UnknownHandle`] if the handle is not registered.
    fn unregister(&mut self, handle: ObjectHandle) -> Result<()>;
}

/// Opaque handle of a registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(u64);

impl ObjectHandle {
    /// Raw handle value
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What kind of object a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Channel factory
    Factory,
    /// Console channel (one client)
    Channel,
    /// Output endpoint
    Frontend,
}

/// A registered object
#[derive(Debug, Clone)]
struct ObjectRecord {
    handle: ObjectHandle,
    label: String,
    kind: ObjectKind,
}

/// Fixed-capacity object registry
pub struct ObjectRegistry {
    /// Slots, `None` when free
    slots: Vec<Option<ObjectRecord>>,
    /// Next handle value; handles are never reused
    next_handle: u64,
    /// Number of occupied slots
    num_objects: usize,
}

impl ObjectRegistry {
    /// Handle values start here so that zero never names an object
    const FIRST_HANDLE: u64 = 0x400;
    /// Handle stride, mirrors capability slot granularity
    const HANDLE_STRIDE: u64 = 0x1000;

    /// Create a registry with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next_handle: Self::FIRST_HANDLE,
            num_objects: 0,
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered objects
    pub fn len(&self) -> usize {
        self.num_objects
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.num_objects == 0
    }

    /// Lookup the first object registered under `label`
    pub fn lookup(&self, label: &str) -> Option<ObjectHandle> {
        self.slots
            .iter()
            .flatten()
            .find(|r| r.label == label)
            .map(|r| r.handle)
    }

    /// Kind of a registered object
    pub fn kind(&self, handle: ObjectHandle) -> Option<ObjectKind> {
        self.slots
            .iter()
            .flatten()
            .find(|r| r.handle == handle)
            .map(|r| r.kind)
    }

    /// List all registered objects as (label, handle) pairs
    pub fn list(&self) -> impl Iterator<Item = (&str, ObjectHandle)> {
        self.slots
            .iter()
            .flatten()
            .map(|r| (r.label.as_str(), r.handle))
    }
}

impl Registry for ObjectRegistry {
    fn register(&mut self, label: &str, kind: ObjectKind) -> Result<ObjectHandle> {
        let capacity = self.slots.len();
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(BrokerError::OutOfSlots { capacity })?;

        let handle = ObjectHandle(self.next_handle);
        self.next_handle += Self::HANDLE_STRIDE;

        *slot = Some(ObjectRecord {
            handle,
            label: label.to_string(),
            kind,
        });
        self.num_objects += 1;

        debug!("registered {:?} '{}' as {}", kind, label, handle);
        Ok(handle)
    }

    fn unregister(&mut self, handle: ObjectHandle) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref().map(|r| r.handle) == Some(handle))
            .ok_or(BrokerError::UnknownHandle(handle))?;

        *slot = None;
        self.num_objects -= 1;
        Ok(())
    }
}
