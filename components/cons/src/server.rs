//! Console server
//!
//! Aggregation root of the concentrator. The server owns the clients (via
//! the [`Controller`]), the multiplexers and the collaborator services:
//! object registry, flush timers and clock. Every external event is one
//! method call: a channel request, a write from a peer, a guest kick,
//! frontend readiness, or timer expiry.

use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};

use cons_broker::{
    ObjectHandle, ObjectKind, ObjectRegistry, Registry, SharedClock, TimeoutQueue, TimerService,
};
use cons_virtio::GuestNotifier;

use crate::attr::{InputFlags, LocalFlags, VconAttr};
use crate::client::{Client, ClientId, ClientParams, Key};
use crate::config::{ChannelOptions, ColorSpec, ConsConfig};
use crate::controller::Controller;
use crate::discipline::{cooked_input, cooked_write, timeout_expired};
use crate::frontend::Frontend;
use crate::mux::{Mux, MuxId, OutputMux};
use crate::transport::{Transport, VconRead, VconTransport};
use crate::virtio::VirtioChannel;
use crate::{ConsError, Result};

/// Tag given to channels created without one
const NONAME_TAG: &str = "<noname>";

/// Transport a new channel uses
pub enum ChannelKind {
    /// Direct line
    Vcon,
    /// Virtio console; `notifier` raises the guest interrupt
    Virtio { notifier: Box<dyn GuestNotifier> },
}

impl fmt::Debug for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Vcon => write!(f, "Vcon"),
            ChannelKind::Virtio { .. } => write!(f, "Virtio"),
        }
    }
}

/// Channel-creation request
#[derive(Debug)]
pub struct ChannelRequest {
    pub tag: String,
    pub color: Option<ColorSpec>,
    pub options: Vec<String>,
    pub kind: ChannelKind,
}

impl ChannelRequest {
    /// Direct-line channel named `tag`
    pub fn vcon(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            color: None,
            options: Vec::new(),
            kind: ChannelKind::Vcon,
        }
    }

    /// Virtio channel named `tag`
    pub fn virtio(tag: &str, notifier: Box<dyn GuestNotifier>) -> Self {
        Self {
            kind: ChannelKind::Virtio { notifier },
            ..Self::vcon(tag)
        }
    }

    pub fn color(mut self, color: ColorSpec) -> Self {
        self.color = Some(color);
        self
    }

    /// Append an option string such as `keep` or `bufsz=4096`
    pub fn option(mut self, opt: &str) -> Self {
        self.options.push(opt.to_string());
        self
    }
}

/// Console server
pub struct ConsServer {
    config: ConsConfig,
    clock: SharedClock,
    registry: ObjectRegistry,
    factory: ObjectHandle,
    timers: TimeoutQueue<ClientId>,
    controller: Controller,
    muxes: Vec<Mux>,
}

impl ConsServer {
    /// Create a server and register its channel factory
    ///
    /// # Errors
    /// [`ConsError::ResourceExhausted`] if the registry has no room for the
    /// factory.
    pub fn new(config: ConsConfig, clock: SharedClock) -> Result<Self> {
        let mut registry = ObjectRegistry::new(config.max_objects);
        let factory = registry.register("cons", ObjectKind::Factory)?;
        info!("console server up, factory {}", factory);

        Ok(Self {
            config,
            clock,
            registry,
            factory,
            timers: TimeoutQueue::new(),
            controller: Controller::new(),
            muxes: Vec::new(),
        })
    }

    pub fn config(&self) -> &ConsConfig {
        &self.config
    }

    /// Handle of the channel factory
    pub fn factory(&self) -> ObjectHandle {
        self.factory
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.controller.get(id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.controller.get_mut(id)
    }

    fn client_entry(&mut self, id: ClientId) -> Result<&mut Client> {
        self.controller
            .get_mut(id)
            .ok_or(ConsError::UnknownClient(id))
    }

    // ------------------------------------------------------------------
    // Multiplexers
    // ------------------------------------------------------------------

    /// Add a multiplexer; the first one added is the default for `show`
    pub fn add_mux(&mut self, name: &str) -> MuxId {
        let id = MuxId(self.muxes.len());
        self.muxes.push(Mux::new(id, name));
        debug!("added multiplexer '{}' as {}", name, id);
        id
    }

    pub fn mux(&self, id: MuxId) -> Option<&Mux> {
        self.muxes.get(id.0)
    }

    pub fn mux_mut(&mut self, id: MuxId) -> Option<&mut Mux> {
        self.muxes.get_mut(id.0)
    }

    fn mux_entry(&mut self, id: MuxId) -> Result<&mut Mux> {
        self.muxes.get_mut(id.0).ok_or(ConsError::UnknownMux(id))
    }

    /// Attach a frontend to `mux` and register it
    ///
    /// # Returns
    /// Index of the frontend on the multiplexer.
    pub fn add_frontend(&mut self, mux: MuxId, frontend: Box<dyn Frontend>) -> Result<usize> {
        let label = {
            let m = self.mux_entry(mux)?;
            format!("{}.fe{}", m.name(), m.num_frontends())
        };
        let handle = self.registry.register(&label, ObjectKind::Frontend)?;
        let idx = self.mux_entry(mux)?.add_frontend(frontend);
        debug!("frontend {} registered as {}", label, handle);
        Ok(idx)
    }

    /// Connect channels tagged `tag` to `mux` as soon as they are created
    pub fn add_auto_connect(&mut self, mux: MuxId, tag: &str) -> Result<()> {
        self.mux_entry(mux)?.add_auto_connect(tag);
        Ok(())
    }

    /// Operator message on every multiplexer
    pub fn sys_msg(&mut self, text: &str) {
        info!("{}", text.trim_end());
        for m in self.muxes.iter_mut() {
            m.sys_msg(text);
        }
    }

    // ------------------------------------------------------------------
    // Channel lifecycle
    // ------------------------------------------------------------------

    /// Create a channel
    ///
    /// Duplicate keys and tags are allowed and only warned about. Clients
    /// sharing a tag get increasing indices.
    ///
    /// # Errors
    /// - [`ConsError::InvalidOption`] / [`ConsError::InvalidColor`] for a
    ///   malformed request
    /// - [`ConsError::ResourceExhausted`] if the registry is full; nothing is
    ///   left registered then
    pub fn create_channel(&mut self, req: ChannelRequest) -> Result<ClientId> {
        let opts = ChannelOptions::parse(&self.config, &req.options)?;
        let color = ColorSpec::resolve(req.color.as_ref())?;
        let tag = if req.tag.is_empty() {
            NONAME_TAG.to_string()
        } else {
            req.tag
        };

        if !opts.key.is_nil() {
            if let Some(other) = self.controller.find_by_key(opts.key) {
                let msg = format!(
                    "WARNING: Multiple clients with key '{}', hiding '{}' behind '{}'",
                    opts.key.value() as char,
                    tag,
                    other.label()
                );
                warn!("{}", msg);
                self.sys_msg(&msg);
            }
        }
        if self.controller.find_by_tag(&tag).is_some() {
            let msg = format!("WARNING: Multiple clients with tag '{}'", tag);
            warn!("{}", msg);
            self.sys_msg(&msg);
        }

        let idx = self.controller.next_idx(&tag);
        let name = if idx == 0 {
            tag.clone()
        } else {
            format!("{}:{}", tag, idx)
        };
        let handle = self.registry.register(&name, ObjectKind::Channel)?;

        let transport: Box<dyn Transport> = match req.kind {
            ChannelKind::Vcon => Box::new(VconTransport::new()),
            ChannelKind::Virtio { notifier } => {
                Box::new(VirtioChannel::new(self.config.virtio_max_desc, notifier))
            }
        };
        let kind = transport.kind();

        let id = self.controller.allocate_id();
        let mut client = Client::new(
            id,
            ClientParams {
                tag: tag.clone(),
                key: opts.key,
                color,
                idx,
                input_buf_size: self.config.input_buf_size,
                output_buf_size: self.config.output_buf_size(opts.bufsz),
                line_buffering: opts.line_buffering,
                line_buffering_ms: opts.line_buffering_ms,
            },
            transport,
        );
        client.set_handle(handle);
        client.set_keep(opts.keep);
        client.set_timestamp(opts.timestamp);
        self.controller.insert(client);

        self.sys_msg(&format!("Created {} channel: {} [{}]", kind, name, handle));

        if opts.show && !self.muxes.is_empty() {
            self.show(MuxId(0), id)?;
        }
        if let Some(pos) = self.muxes.iter().position(|m| m.is_auto_connect(&tag)) {
            self.connect(MuxId(pos), id)?;
        }
        Ok(id)
    }

    /// The channel peer went away
    ///
    /// # Returns
    /// `true` if the client was destroyed, `false` if it is kept.
    pub fn disconnect(&mut self, id: ClientId) -> Result<bool> {
        let destroy = self.client_entry(id)?.collected();
        if destroy {
            self.destroy(id)?;
        } else {
            debug!("keeping disconnected client {}", id);
        }
        Ok(destroy)
    }

    /// Release a client
    ///
    /// Cancels its flush timer, detaches it from its multiplexer, removes it
    /// from the controller and unregisters it.
    pub fn destroy(&mut self, id: ClientId) -> Result<()> {
        let client = self
            .controller
            .remove(id)
            .ok_or(ConsError::UnknownClient(id))?;

        self.timers.remove_timeout(id);
        if let Some(m) = client.output().and_then(|m| self.muxes.get_mut(m.0)) {
            m.detach(id);
        }
        if let Some(handle) = client.handle() {
            if let Err(e) = self.registry.unregister(handle) {
                warn!("unregistering {}: {}", client.label(), e);
            }
        }
        debug!("destroyed client {} ({})", client.label(), id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Output from the channel peer
    pub fn write(&mut self, id: ClientId, data: &[u8]) -> Result<()> {
        let client = self
            .controller
            .get_mut(id)
            .ok_or(ConsError::UnknownClient(id))?;

        let out = match client.output() {
            Some(m) => self.muxes.get_mut(m.0).map(|m| m as &mut dyn OutputMux),
            None => None,
        };

        match cooked_write(client, data, out, self.clock.as_ref()) {
            Some(delay) => self.timers.add_timeout(id, self.clock.now() + delay),
            None => {
                self.timers.remove_timeout(id);
            }
        }
        Ok(())
    }

    /// Input pulled by the channel peer
    pub fn read(&mut self, id: ClientId, buf: &mut [u8]) -> Result<VconRead> {
        let client = self.client_entry(id)?;
        client.transport.read(&mut client.rbuf, buf)
    }

    pub fn get_attr(&self, id: ClientId) -> Result<VconAttr> {
        self.client(id)
            .map(Client::attr)
            .ok_or(ConsError::UnknownClient(id))
    }

    pub fn set_attr(&mut self, id: ClientId, attr: VconAttr) -> Result<()> {
        self.client_entry(id)?.set_attr(attr);
        Ok(())
    }

    /// The peer of a client signalled the server
    ///
    /// For a virtio channel this collects guest output, which goes through
    /// the line discipline like any write, and hands pending input to the
    /// guest.
    pub fn kick_client(&mut self, id: ClientId) -> Result<()> {
        let client = self.client_entry(id)?;
        let mut produced = Vec::new();
        let result = client.transport.kick(&mut client.rbuf, &mut produced);
        if let Err(e) = &result {
            warn!("kick of {} failed: {}", client.label(), e);
        }

        if !produced.is_empty() {
            self.write(id, &produced)?;
        }
        result
    }

    /// Input for a client, from a frontend or injected directly
    ///
    /// `brk` records a break ahead of `data` unless the client ignores
    /// breaks. The transport is triggered when the input ring was empty.
    pub fn deliver_input(&mut self, id: ClientId, data: &[u8], brk: bool) -> Result<()> {
        let client = self.client_entry(id)?;
        let attr = client.attr;

        let mut was_empty = false;
        if brk && !attr.iflags.contains(InputFlags::IGNBRK) {
            was_empty |= client.rbuf.put_break();
        }
        let cooked = cooked_input(&attr, data);
        if !cooked.is_empty() {
            was_empty |= client.rbuf.put_slice(&cooked);
        }
        if was_empty {
            client.transport.trigger(&mut client.rbuf)?;
        }

        if attr.lflags.contains(LocalFlags::ECHO) && !cooked.is_empty() {
            self.write(id, &cooked)?;
        }
        Ok(())
    }

    /// A frontend is readable or has room again
    ///
    /// Pending frontend output is retried and typed input goes to the
    /// client connected to the multiplexer.
    pub fn service_frontend(&mut self, mux: MuxId, idx: usize) -> Result<()> {
        let m = self.mux_entry(mux)?;
        let connected = m.connected();
        let fe = m
            .frontend_mut(idx)
            .ok_or_else(|| ConsError::Frontend(format!("no frontend {} on {}", idx, mux)))?;

        if let Err(e) = fe.service() {
            warn!("{}: servicing frontend {}: {}", mux, idx, e);
        }
        let mut input = Vec::new();
        let got_input = fe.check_input(&mut input);
        let brk = fe.take_break();
        if !got_input && !brk {
            return Ok(());
        }

        match connected {
            Some(id) => self.deliver_input(id, &input, brk),
            None => {
                debug!("{}: no client connected, dropping {} input bytes", mux, input.len());
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------

    /// Route the output of a client to `mux`
    ///
    /// Buffered output is not replayed, the client starts showing from
    /// its current head. Showing a client where it already is keeps a
    /// held-back line for its flush timer.
    pub fn show(&mut self, mux: MuxId, id: ClientId) -> Result<()> {
        if mux.0 >= self.muxes.len() {
            return Err(ConsError::UnknownMux(mux));
        }
        let client = self
            .controller
            .get_mut(id)
            .ok_or(ConsError::UnknownClient(id))?;

        match client.output() {
            Some(prev) if prev == mux => return Ok(()),
            Some(prev) => {
                if let Some(m) = self.muxes.get_mut(prev.0) {
                    m.detach(id);
                }
            }
            None => {}
        }
        client.set_output(Some(mux));
        client.skip_unwritten();
        Ok(())
    }

    /// Stop routing the output of a client anywhere
    pub fn hide(&mut self, id: ClientId) -> Result<()> {
        let client = self
            .controller
            .get_mut(id)
            .ok_or(ConsError::UnknownClient(id))?;

        if let Some(m) = client.output().and_then(|m| self.muxes.get_mut(m.0)) {
            m.detach(id);
        }
        client.set_output(None);
        client.skip_unwritten();
        self.timers.remove_timeout(id);
        Ok(())
    }

    /// Show a client on `mux` and give it the multiplexer's input
    pub fn connect(&mut self, mux: MuxId, id: ClientId) -> Result<()> {
        self.show(mux, id)?;
        self.mux_entry(mux)?.connect(id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn find_by_key(&self, key: Key) -> Option<ClientId> {
        self.controller.find_by_key(key).map(Client::id)
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<ClientId> {
        self.controller.find_by_tag(tag).map(Client::id)
    }

    /// Resolve `tag` or `tag:N`
    pub fn find_by_name(&self, name: &str) -> Option<ClientId> {
        self.controller.find_by_name(name).map(Client::id)
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Flush timer of `id` fired
    ///
    /// Stale timers of destroyed or hidden clients are ignored.
    pub fn on_timeout(&mut self, id: ClientId) {
        self.timers.remove_timeout(id);
        let Some(client) = self.controller.get_mut(id) else {
            return;
        };
        if let Some(m) = client.output().and_then(|m| self.muxes.get_mut(m.0)) {
            timeout_expired(client, m);
        }
    }

    /// Fire every timer due at `now`
    ///
    /// # Returns
    /// Number of timers fired.
    pub fn run_timers(&mut self, now: Instant) -> usize {
        let expired = self.timers.expire(now);
        for &id in &expired {
            self.on_timeout(id);
        }
        expired.len()
    }

    /// When the event loop has to call [`Self::run_timers`] next
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }
}

impl fmt::Debug for ConsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsServer")
            .field("factory", &self.factory)
            .field("clients", &self.controller.len())
            .field("muxes", &self.muxes)
            .field("timers", &self.timers.len())
            .finish()
    }
}
