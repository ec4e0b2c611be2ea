//! Serial backend for [`LineDevice`].
//!
//! The port is opened 8N1 with no flow control. A background task owns the
//! read half, splits the byte stream on `\n`, decodes each line as Latin-1
//! (so stray bytes from a noisy UART never fail decoding) and forwards it over
//! an unbounded channel. When the task ends the device reports itself closed
//! and the owning controller reconnects on its next operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use super::{DeviceConnector, DeviceError, DeviceResult, LineDevice};

/// A serial port exposed as a [`LineDevice`].
pub struct SerialLineDevice {
    port: String,
    writer: WriteHalf<SerialStream>,
    lines: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SerialLineDevice {
    /// Open `port` at `baud`, 8 data bits, no parity, one stop bit.
    pub fn open(port: &str, baud: u32) -> DeviceResult<Self> {
        let stream = tokio_serial::new(port, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| DeviceError::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;

        let (read_half, writer) = tokio::io::split(stream);
        let (tx, lines) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_lines(
            port.to_string(),
            read_half,
            tx,
            Arc::clone(&open),
        ));

        info!(port, baud, "serial port opened");

        Ok(Self {
            port: port.to_string(),
            writer,
            lines,
            open,
            reader,
        })
    }
}

impl Drop for SerialLineDevice {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decode bytes one-to-one as Latin-1 code points.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

async fn read_lines(
    port: String,
    read_half: ReadHalf<SerialStream>,
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                warn!(port = %port, "serial port reached end of stream");
                break;
            }
            Ok(_) => {
                let decoded = decode_latin1(&buf);
                let line = decoded.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(port = %port, line, "rx");
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(port = %port, error = %e, "serial read failed");
                break;
            }
        }
    }

    open.store(false, Ordering::SeqCst);
}

#[async_trait]
impl LineDevice for SerialLineDevice {
    fn port(&self) -> &str {
        &self.port
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    async fn write_line(&mut self, line: &str) -> DeviceResult<()> {
        if !self.is_open() {
            return Err(DeviceError::Closed {
                port: self.port.clone(),
            });
        }

        let mut payload = line.as_bytes().to_vec();
        if !line.ends_with('\n') {
            payload.push(b'\n');
        }

        debug!(port = %self.port, line = line.trim_end(), "tx");
        let port = self.port.clone();
        self.writer
            .write_all(&payload)
            .await
            .map_err(|source| DeviceError::Io {
                port: port.clone(),
                source,
            })?;
        self.writer
            .flush()
            .await
            .map_err(|source| DeviceError::Io { port, source })
    }

    async fn read_line(&mut self, timeout: Duration) -> DeviceResult<Option<String>> {
        match tokio::time::timeout(timeout, self.lines.recv()).await {
            Ok(Some(line)) => Ok(Some(line)),
            Ok(None) => Err(DeviceError::Closed {
                port: self.port.clone(),
            }),
            Err(_) => Ok(None),
        }
    }

    fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.lines.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            debug!(port = %self.port, error = %e, "error shutting down serial writer");
        }
        info!(port = %self.port, "serial port closed");
    }
}

/// Opens [`SerialLineDevice`]s for one port.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
        }
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }
}

#[async_trait]
impl DeviceConnector for SerialConnector {
    fn port(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> DeviceResult<Box<dyn LineDevice>> {
        let device = SerialLineDevice::open(&self.port, self.baud)?;
        Ok(Box::new(device))
    }
}
