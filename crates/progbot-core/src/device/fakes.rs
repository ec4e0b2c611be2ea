//! In-memory [`LineDevice`] for tests and dry runs.
//!
//! A [`FakeLineDevice`] records every line written to it and answers through
//! a responder closure. Clones share state, so a test can keep one handle for
//! assertions while a controller owns another.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceConnector, DeviceError, DeviceResult, LineDevice};

/// Maps a written line to the lines the device sends back.
pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct FakeState {
    sent: Vec<String>,
    pending: VecDeque<String>,
    open: bool,
    responder: Option<Responder>,
}

/// Scripted line device.
#[derive(Clone)]
pub struct FakeLineDevice {
    port: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeLineDevice {
    /// A device that never answers.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            state: Arc::new(Mutex::new(FakeState {
                sent: Vec::new(),
                pending: VecDeque::new(),
                open: true,
                responder: None,
            })),
        }
    }

    /// A device that answers every written line through `responder`.
    pub fn with_responder<F>(port: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let dev = Self::new(port);
        dev.set_responder(responder);
        dev
    }

    /// A device that answers every line with the same reply.
    pub fn always(port: impl Into<String>, reply: &str) -> Self {
        let reply = reply.to_string();
        Self::with_responder(port, move |_| vec![reply.clone()])
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    /// Queue an unsolicited line.
    pub fn push_line(&self, line: &str) {
        self.state
            .lock()
            .unwrap()
            .pending
            .push_back(line.to_string());
    }

    /// Every line written so far, without line terminators.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Simulate the cable being pulled.
    pub fn close_link(&self) {
        self.state.lock().unwrap().open = false;
    }

    fn reopen(&self) {
        self.state.lock().unwrap().open = true;
    }
}

#[async_trait]
impl LineDevice for FakeLineDevice {
    fn port(&self) -> &str {
        &self.port
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    async fn write_line(&mut self, line: &str) -> DeviceResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(DeviceError::Closed {
                port: self.port.clone(),
            });
        }
        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&line),
            None => Vec::new(),
        };
        state.sent.push(line);
        state.pending.extend(replies);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> DeviceResult<Option<String>> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(line) = state.pending.pop_front() {
                return Ok(Some(line));
            }
            if !state.open {
                return Err(DeviceError::Closed {
                    port: self.port.clone(),
                });
            }
        }
        tokio::time::sleep(timeout).await;
        Ok(self.state.lock().unwrap().pending.pop_front())
    }

    fn drain(&mut self) -> usize {
        let mut state = self.state.lock().unwrap();
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    async fn close(&mut self) {
        self.close_link();
    }
}

/// Hands out clones of one [`FakeLineDevice`], reviving it on every open.
#[derive(Clone)]
pub struct FakeConnector {
    device: FakeLineDevice,
    opens: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(device: FakeLineDevice) -> Self {
        Self {
            device,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times the device has been opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn device(&self) -> &FakeLineDevice {
        &self.device
    }
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    fn port(&self) -> &str {
        &self.device.port
    }

    async fn open(&self) -> DeviceResult<Box<dyn LineDevice>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.device.reopen();
        Ok(Box::new(self.device.clone()))
    }
}
