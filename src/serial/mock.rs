//! Scripted stand-in for the bridge adapter and the devices behind it.
//!
//! Every line written to the port is recorded. Replies are looked up by the exact command text:
//! one-shot replies are consumed in order first, then the sticky reply (if any) is repeated.
//! Commands without a reply produce no output, the same as a silent bus device.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Result, SerialError, SerialPortIO};

#[derive(Default)]
struct MockState {
    raw_written: Vec<u8>,
    partial: String,
    commands: Vec<String>,
    pending: VecDeque<u8>,
    once: HashMap<String, VecDeque<String>>,
    sticky: HashMap<String, String>,
    fail_reads: bool,
    fail_writes: bool,
}

#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply to `command` with `response` every time it is written
    pub fn reply(self, command: &str, response: &str) -> Self {
        self.state().sticky.insert(command.to_string(), response.to_string());
        self
    }

    /// Reply to the next write of `command` only; queued ahead of any sticky reply
    pub fn reply_once(self, command: &str, response: &str) -> Self {
        self.state()
            .once
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Queue a sequence of one-shot replies for `command`
    pub fn reply_sequence(self, command: &str, responses: &[&str]) -> Self {
        responses.iter().fold(self, |mock, r| mock.reply_once(command, r))
    }

    /// Make bytes available to the reader as if the device sent them unprompted
    pub fn inject(&self, text: &str) {
        self.state().pending.extend(text.as_bytes());
    }

    pub fn set_read_failure(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Commands written so far, terminators stripped
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.state().commands.iter().filter(|c| c.as_str() == command).count()
    }

    pub fn raw_written(&self) -> Vec<u8> {
        self.state().raw_written.clone()
    }
}

impl MockState {
    fn accept(&mut self, data: &[u8]) {
        self.raw_written.extend_from_slice(data);
        self.partial.push_str(&String::from_utf8_lossy(data));

        while let Some(pos) = self.partial.find(['\r', '\n']) {
            let line = self.partial[..pos].to_string();
            let rest = self.partial[pos + 1..].trim_start_matches(['\r', '\n']).to_string();
            self.partial = rest;
            if !line.is_empty() {
                self.respond(line);
            }
        }
    }

    fn respond(&mut self, command: String) {
        let reply = self
            .once
            .get_mut(&command)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.sticky.get(&command).cloned());

        if let Some(reply) = reply {
            self.pending.extend(reply.as_bytes());
            self.pending.extend(b"\r\n");
        }
        self.commands.push(command);
    }
}

#[async_trait::async_trait]
impl SerialPortIO for MockPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        state.accept(data);
        Ok(())
    }

    async fn bytes_available(&mut self) -> Result<usize> {
        let state = self.state();
        if state.fail_reads {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "mock read failure",
            )));
        }
        Ok(state.pending.len())
    }

    async fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state();
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
