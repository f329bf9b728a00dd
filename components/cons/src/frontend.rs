//! Frontends
//!
//! A frontend is a sink rendering multiplexed output, and optionally a
//! source of operator input. The multiplexer only sees the [`Frontend`]
//! trait; concrete frontends are a shared in-memory buffer, any
//! [`std::io::Write`] sink, and the virtio console device
//! ([`crate::virtio::VirtioFrontend`]).

use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::{ConsError, Result};

/// Output sink and input source of a multiplexer
pub trait Frontend {
    /// Write `data`, returns the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Move pending input into `buf`
    ///
    /// # Returns
    /// `true` if input was appended.
    fn check_input(&mut self, buf: &mut Vec<u8>) -> bool;

    /// A break was received since the last call
    fn take_break(&mut self) -> bool {
        false
    }

    /// Buffer space became available downstream
    fn service(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Default)]
struct BufferState {
    output: Vec<u8>,
    input: Vec<u8>,
    breaks: usize,
    flushes: usize,
}

/// In-memory frontend
///
/// Clones share the same buffers, so a caller can keep a handle after
/// moving the frontend into a multiplexer.
#[derive(Debug, Clone, Default)]
pub struct BufferFrontend {
    state: Rc<RefCell<BufferState>>,
}

impl BufferFrontend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn output(&self) -> Vec<u8> {
        self.state.borrow().output.clone()
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().output).into_owned()
    }

    /// Take and clear the written output
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().output)
    }

    /// Queue operator input
    pub fn push_input(&self, data: &[u8]) {
        self.state.borrow_mut().input.extend_from_slice(data);
    }

    /// Queue a break
    pub fn push_break(&self) {
        self.state.borrow_mut().breaks += 1;
    }

    /// Number of flushes requested
    pub fn flushes(&self) -> usize {
        self.state.borrow().flushes
    }
}

impl Frontend for BufferFrontend {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.state.borrow_mut().output.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.state.borrow_mut().flushes += 1;
        Ok(())
    }

    fn check_input(&mut self, buf: &mut Vec<u8>) -> bool {
        let mut state = self.state.borrow_mut();
        if state.input.is_empty() {
            return false;
        }
        buf.append(&mut state.input);
        true
    }

    fn take_break(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.breaks == 0 {
            return false;
        }
        state.breaks -= 1;
        true
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Output-only frontend over an [`io::Write`] sink
#[derive(Debug)]
pub struct WriterFrontend<W: io::Write> {
    writer: W,
}

impl<W: io::Write> WriterFrontend<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: io::Write + 'static> Frontend for WriterFrontend<W> {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer
            .write_all(data)
            .map_err(|e| ConsError::Frontend(e.to_string()))?;
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| ConsError::Frontend(e.to_string()))
    }

    fn check_input(&mut self, _buf: &mut Vec<u8>) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
