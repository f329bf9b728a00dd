//! Multiplexer
//!
//! A mux owns a set of frontends. Clients shown on the mux have their
//! output routed to every frontend of the mux; at most one client is
//! connected, it gets the input typed on those frontends and its output is
//! written as is. Output of the other shown clients is prefixed, line by
//! line, with the client's name in its colour.
//!
//! The mux does not buffer client output; the client's ring is the buffer.

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, warn};

use crate::client::{ClientId, ClientLabel};
use crate::frontend::Frontend;

const RESET: &str = "\x1b[0m";

/// Index of a mux inside the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MuxId(pub(crate) usize);

impl fmt::Display for MuxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mux{}", self.0)
    }
}

/// Output routing interface used by the line discipline
pub trait OutputMux {
    /// New output of `client`
    fn write(&mut self, client: &ClientLabel<'_>, data: &[u8]);

    /// Push written output out of the frontends
    fn flush(&mut self, client: &ClientLabel<'_>);
}

/// Multiplexer over a set of frontends
pub struct Mux {
    id: MuxId,
    name: String,
    frontends: Vec<Box<dyn Frontend>>,
    connected: Option<ClientId>,
    /// Client whose line is unfinished on the frontends
    open_line: Option<ClientId>,
    /// Tags connected automatically when created
    auto_connect: BTreeSet<String>,
}

impl Mux {
    pub fn new(id: MuxId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            frontends: Vec::new(),
            connected: None,
            open_line: None,
            auto_connect: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> MuxId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a frontend, returns its index
    pub fn add_frontend(&mut self, frontend: Box<dyn Frontend>) -> usize {
        self.frontends.push(frontend);
        self.frontends.len() - 1
    }

    pub fn num_frontends(&self) -> usize {
        self.frontends.len()
    }

    pub fn frontend_mut(&mut self, idx: usize) -> Option<&mut dyn Frontend> {
        match self.frontends.get_mut(idx) {
            Some(fe) => Some(fe.as_mut()),
            None => None,
        }
    }

    /// Client receiving input
    pub fn connected(&self) -> Option<ClientId> {
        self.connected
    }

    /// Route input to `client`
    pub fn connect(&mut self, client: ClientId) {
        debug!("{}: connected {}", self.name, client);
        self.connected = Some(client);
    }

    /// Forget `client`: it is no longer connected and its open line ends
    pub fn detach(&mut self, client: ClientId) {
        if self.connected == Some(client) {
            self.connected = None;
        }
        if self.open_line == Some(client) {
            self.end_line();
        }
    }

    pub fn add_auto_connect(&mut self, tag: &str) {
        self.auto_connect.insert(tag.to_string());
    }

    pub fn is_auto_connect(&self, tag: &str) -> bool {
        self.auto_connect.contains(tag)
    }

    /// Write an operator message to every frontend
    pub fn sys_msg(&mut self, text: &str) {
        self.end_line();
        let text = text.trim_end_matches('\n').replace('\n', "\r\n");
        self.emit(text.as_bytes());
        self.emit(b"\r\n");
        self.flush_frontends();
    }

    fn end_line(&mut self) {
        if self.open_line.take().is_some() {
            self.emit(b"\r\n");
        }
    }

    fn emit(&mut self, data: &[u8]) {
        for fe in self.frontends.iter_mut() {
            if let Err(e) = fe.write(data) {
                warn!("{}: frontend write failed: {}", self.name, e);
            }
        }
    }

    fn flush_frontends(&mut self) {
        for fe in self.frontends.iter_mut() {
            if let Err(e) = fe.flush() {
                warn!("{}: frontend flush failed: {}", self.name, e);
            }
        }
    }
}

impl OutputMux for Mux {
    fn write(&mut self, client: &ClientLabel<'_>, data: &[u8]) {
        let prefixed = self.connected != Some(client.id);
        let mut rest = data;

        while !rest.is_empty() {
            if self.open_line != Some(client.id) {
                self.end_line();
                if prefixed {
                    let prefix = format!("{}{}{}: ", client.color.ansi(), client, RESET);
                    self.emit(prefix.as_bytes());
                }
                self.open_line = Some(client.id);
            }

            let end = rest
                .iter()
                .position(|&b| b == b'\n')
                .map_or(rest.len(), |p| p + 1);
            self.emit(&rest[..end]);
            if rest[end - 1] == b'\n' {
                self.open_line = None;
            }
            rest = &rest[end..];
        }
    }

    fn flush(&mut self, _client: &ClientLabel<'_>) {
        self.flush_frontends();
    }
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("frontends", &self.frontends.len())
            .field("connected", &self.connected)
            .field("auto_connect", &self.auto_connect)
            .finish()
    }
}
