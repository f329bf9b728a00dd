//! Console client
//!
//! A client is one console channel: an output ring fed by the line
//! discipline, an input ring fed by the multiplexer, an identity used for
//! addressing, and the transport that talks to the channel's peer.

use std::fmt;

use cons_broker::ObjectHandle;
use cons_ring::{Index, RingBuffer};

use crate::attr::VconAttr;
use crate::config::Color;
use crate::discipline::MAX_TIMESTAMP_LEN;
use crate::mux::MuxId;
use crate::transport::Transport;

/// Identity of a client inside the server
///
/// Ids grow with creation order, so ordering by id is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub(crate) u64);

impl ClientId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-character hotkey of a client, zero when unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Key(u8);

impl Key {
    pub fn new(key: u8) -> Self {
        Self(key)
    }

    /// The unset key
    pub fn nil() -> Self {
        Self(0)
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Addressing equality: an unset key never matches anything
    pub fn matches(self, other: Key) -> bool {
        !self.is_nil() && self.0 == other.0
    }
}

/// Display data a multiplexer needs about the writer
#[derive(Debug, Clone, Copy)]
pub struct ClientLabel<'a> {
    pub id: ClientId,
    pub tag: &'a str,
    pub idx: u32,
    pub color: Color,
}

impl fmt::Display for ClientLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.idx == 0 {
            write!(f, "{}", self.tag)
        } else {
            write!(f, "{}:{}", self.tag, self.idx)
        }
    }
}

/// Smallest output ring; one batch must fit a timestamp, a byte and its `\r`
pub const MIN_WBUF_SIZE: usize = MAX_TIMESTAMP_LEN + 3;

/// Construction parameters of a client
pub struct ClientParams {
    pub tag: String,
    pub key: Key,
    pub color: Color,
    pub idx: u32,
    pub input_buf_size: usize,
    pub output_buf_size: usize,
    pub line_buffering: bool,
    pub line_buffering_ms: u64,
}

/// One console channel
pub struct Client {
    id: ClientId,
    handle: Option<ObjectHandle>,
    tag: String,
    key: Key,
    /// Disambiguates clients sharing a tag
    pub(crate) idx: u32,
    color: Color,
    pub(crate) attr: VconAttr,
    keep: bool,
    dead: bool,
    pub(crate) timestamp: bool,
    /// Next output byte starts a line
    pub(crate) new_line: bool,
    pub(crate) line_buffering: bool,
    pub(crate) line_buffering_ms: u64,
    pub(crate) wbuf: RingBuffer,
    pub(crate) rbuf: RingBuffer,
    /// Output before this index has been handed to the multiplexer
    pub(crate) first_unwritten: Index,
    output: Option<MuxId>,
    pub(crate) transport: Box<dyn Transport>,
}

impl Client {
    /// Create a client; its attributes start as the transport's defaults
    ///
    /// The output ring has at least [`MIN_WBUF_SIZE`] slots.
    pub fn new(id: ClientId, params: ClientParams, transport: Box<dyn Transport>) -> Self {
        let wbuf = RingBuffer::new(params.output_buf_size.max(MIN_WBUF_SIZE));
        let first_unwritten = wbuf.head();
        Self {
            id,
            handle: None,
            tag: params.tag,
            key: params.key,
            idx: params.idx,
            color: params.color,
            attr: transport.default_attr(),
            keep: false,
            dead: false,
            timestamp: false,
            new_line: true,
            line_buffering: params.line_buffering,
            line_buffering_ms: params.line_buffering_ms,
            wbuf,
            rbuf: RingBuffer::new(params.input_buf_size),
            first_unwritten,
            output: None,
            transport,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Registry handle, once registered
    pub fn handle(&self) -> Option<ObjectHandle> {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: ObjectHandle) {
        self.handle = Some(handle);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn attr(&self) -> VconAttr {
        self.attr
    }

    pub fn set_attr(&mut self, attr: VconAttr) {
        self.attr = attr;
    }

    pub fn keep(&self) -> bool {
        self.keep
    }

    pub fn set_keep(&mut self, keep: bool) {
        self.keep = keep;
    }

    pub fn dead(&self) -> bool {
        self.dead
    }

    pub fn timestamp(&self) -> bool {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: bool) {
        self.timestamp = timestamp;
    }

    pub fn line_buffering(&self) -> bool {
        self.line_buffering
    }

    /// Output ring
    pub fn wbuf(&self) -> &RingBuffer {
        &self.wbuf
    }

    /// Input ring
    pub fn rbuf(&self) -> &RingBuffer {
        &self.rbuf
    }

    /// Multiplexer the client is shown on
    pub fn output(&self) -> Option<MuxId> {
        self.output
    }

    pub(crate) fn set_output(&mut self, mux: Option<MuxId>) {
        self.output = mux;
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Output not yet handed to the multiplexer
    pub fn unwritten(&self) -> usize {
        self.wbuf.distance(self.first_unwritten, self.wbuf.head())
    }

    pub fn label(&self) -> ClientLabel<'_> {
        ClientLabel {
            id: self.id,
            tag: &self.tag,
            idx: self.idx,
            color: self.color,
        }
    }

    /// The peer went away
    ///
    /// # Returns
    /// `true` if the client may be destroyed now, `false` if it is kept.
    pub fn collected(&mut self) -> bool {
        self.dead = true;
        !self.keep
    }

    /// Drop the obligation to flush buffered output
    pub fn skip_unwritten(&mut self) {
        self.first_unwritten = self.wbuf.head();
    }

    /// Matches `key`
    pub fn matches_key(&self, key: Key) -> bool {
        key.matches(self.key)
    }

    /// Tag equals `tag`
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.tag == tag
    }

    /// Matches an addressing name: the bare tag names index 0, `tag:N`
    /// names index N
    pub fn matches_name(&self, name: &str) -> bool {
        if name == self.tag && self.idx == 0 {
            return true;
        }

        let Some((tag, idx)) = name.rsplit_once(':') else {
            return false;
        };
        if tag != self.tag {
            return false;
        }
        idx.parse::<u32>().map_or(false, |i| i == self.idx)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("idx", &self.idx)
            .field("key", &self.key)
            .field("kind", &self.transport.kind())
            .field("output", &self.output)
            .field("keep", &self.keep)
            .field("dead", &self.dead)
            .finish()
    }
}
