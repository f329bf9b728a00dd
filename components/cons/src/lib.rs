//! Console Server - Concentrates many client consoles onto shared frontends
//!
//! # Purpose
//! Each client (a guest, a component) gets a console channel. Its output is
//! rewritten by a line discipline, buffered in a ring, and pushed through a
//! multiplexer to the frontends (terminals, a virtio console) attached to
//! that multiplexer. Input typed on a frontend goes to the client the
//! multiplexer is connected to.
//!
//! # Integration Points
//! - Depends on: `cons-ring` (buffers), `cons-broker` (registry, timers,
//!   clock), `cons-virtio` (virtio console device)
//! - Provides to: whatever event loop delivers channel requests, frontend
//!   readiness, guest kicks and timer expiry
//!
//! # Architecture
//! ```text
//!  write(id, bytes)                                   frontends
//!        │                                        ┌──────────────┐
//!  ┌─────▼──────┐  cooked  ┌────────┐  do_output  │  Mux ──► fe0 │
//!  │ discipline ├─────────►│ Client ├────────────►│      ──► fe1 │
//!  └────────────┘          │ wbuf   │             └──────┬───────┘
//!                          │ rbuf ◄─┼── input ───────────┘
//!                          └───┬────┘
//!                              │ Transport (vcon | virtio)
//!                              ▼
//!                        channel peer
//! ```
//!
//! Everything runs on one thread. The server is driven entirely by method
//! calls; it never blocks and owns no threads.

pub mod attr;
pub mod client;
pub mod config;
pub mod controller;
pub mod discipline;
pub mod frontend;
pub mod mux;
pub mod server;
pub mod transport;
pub mod virtio;

pub use attr::{InputFlags, LocalFlags, OutputFlags, VconAttr};
pub use client::{Client, ClientId, Key};
pub use config::{ChannelOptions, Color, ColorSpec, ConsConfig};
pub use controller::Controller;
pub use frontend::{BufferFrontend, Frontend, WriterFrontend};
pub use mux::{Mux, MuxId, OutputMux};
pub use server::{ChannelKind, ChannelRequest, ConsServer};
pub use transport::{ReadStatus, Transport, TransportKind, VconRead, VconTransport};
pub use virtio::{VirtioChannel, VirtioFrontend};

use cons_broker::BrokerError;
use cons_virtio::VirtioError;
use thiserror::Error;

/// Console server errors
#[derive(Debug, Error)]
pub enum ConsError {
    /// Registration or allocation failed while creating an object
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(#[from] BrokerError),

    #[error("Invalid channel option: {0}")]
    InvalidOption(String),

    #[error("Invalid color: {0}")]
    InvalidColor(String),

    #[error("Unknown client {0}")]
    UnknownClient(ClientId),

    #[error("Unknown multiplexer {0}")]
    UnknownMux(MuxId),

    /// Operation not offered by the client's transport
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Virtio error: {0}")]
    Virtio(#[from] VirtioError),

    #[error("Frontend error: {0}")]
    Frontend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for console server operations
pub type Result<T> = core::result::Result<T, ConsError>;
