//! ELM327 adapter over TCP
//!
//! Wi-Fi OBD-II dongles expose the ELM327 command set on a TCP port
//! (commonly 35000). Requests are ASCII lines terminated by `\r`; the adapter
//! answers with one or more lines and then a `>` prompt.
//!
//! Only one request may be outstanding on the link, so every exchange holds
//! the link mutex from write to prompt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{SourceError, SourceFactory, TelemetrySource};
use crate::commands::CommandDescriptor;

/// Reset, echo off, linefeeds off, spaces off, automatic protocol
const INIT_SEQUENCE: &[&str] = &["ATZ", "ATE0", "ATL0", "ATS0", "ATSP0"];

/// Upper bound on a single response before the prompt
const MAX_RESPONSE_BYTES: usize = 4096;

/// Markers the adapter prints instead of data when a request fails
const ERROR_MARKERS: &[&str] = &["?", "ERROR", "UNABLE TO CONNECT", "STOPPED", "CAN ERROR"];

/// Telemetry source backed by an ELM327 adapter
pub struct Elm327Source {
    label: String,
    link: Mutex<Option<TcpStream>>,
}

impl Elm327Source {
    /// Connect to the adapter and run the init sequence
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Unavailable`] if the adapter cannot be reached
    /// or rejects initialization.
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self, SourceError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| SourceError::Unavailable(format!("connecting to {address} timed out")))?
            .map_err(|e| SourceError::Unavailable(format!("connecting to {address}: {e}")))?;
        stream.set_nodelay(true)?;

        let source = Self {
            label: format!("elm327 {address}"),
            link: Mutex::new(Some(stream)),
        };

        for command in INIT_SEQUENCE {
            let reply = source
                .exchange(command, connect_timeout)
                .await
                .map_err(|e| SourceError::Unavailable(format!("{command} failed: {e}")))?;
            debug!(command, reply = %reply.trim(), "Adapter init");

            // ATZ answers with the adapter banner rather than OK
            if *command != "ATZ" && !reply.to_ascii_uppercase().contains("OK") {
                return Err(SourceError::Unavailable(format!(
                    "{command} rejected: {}",
                    reply.trim()
                )));
            }
        }

        info!(address, "ELM327 adapter initialized");
        Ok(source)
    }

    /// Send one request line and collect the reply up to the prompt
    ///
    /// Bytes left in the socket by an exchange that timed out are discarded
    /// before the request is written. A reply that is still in transit when
    /// the next request goes out is read in its place; that exchange fails
    /// the PID check and the discard before the following request clears
    /// the remainder.
    async fn exchange(&self, line: &str, timeout: Duration) -> Result<String, SourceError> {
        let mut link = self.link.lock().await;
        let stream = link.as_mut().ok_or(SourceError::Closed)?;

        tokio::time::timeout(timeout, exchange_on(stream, line))
            .await
            .map_err(|_| SourceError::Timeout(timeout))?
    }
}

async fn exchange_on(stream: &mut TcpStream, line: &str) -> Result<String, SourceError> {
    let stale = discard_pending(stream)?;
    if stale > 0 {
        debug!(stale, "Discarded leftover adapter output");
    }
    stream.write_all(format!("{line}\r").as_bytes()).await?;

    let mut response = Vec::with_capacity(64);
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(SourceError::QueryFailed(
                "adapter closed the connection".to_string(),
            ));
        }
        response.extend_from_slice(&buf[..n]);

        if let Some(prompt) = response.iter().position(|b| *b == b'>') {
            response.truncate(prompt);
            return Ok(String::from_utf8_lossy(&response).into_owned());
        }
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(SourceError::QueryFailed("response too long".to_string()));
        }
    }
}

/// Drop whatever the adapter already sent without waiting for more
fn discard_pending(stream: &TcpStream) -> Result<usize, SourceError> {
    let mut buf = [0u8; 256];
    let mut discarded = 0;
    loop {
        match stream.try_read(&mut buf) {
            Ok(0) => {
                return Err(SourceError::QueryFailed(
                    "adapter closed the connection".to_string(),
                ));
            }
            Ok(n) => discarded += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(discarded),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Extract the data bytes of a mode 01 response for `pid`
///
/// Returns `Ok(None)` for `NO DATA`.
///
/// # Errors
///
/// Returns [`SourceError::QueryFailed`] if the adapter reported an error or
/// no line carried the expected `41 <pid>` header.
pub fn parse_response(raw: &str, pid: u8) -> Result<Option<Vec<u8>>, SourceError> {
    let upper = raw.to_ascii_uppercase();
    if upper.contains("NO DATA") {
        return Ok(None);
    }
    if let Some(marker) = ERROR_MARKERS.iter().find(|m| upper.contains(*m)) {
        return Err(SourceError::QueryFailed(format!("adapter reported {marker}")));
    }

    for line in upper.split(['\r', '\n']) {
        let hex: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        let Some(bytes) = decode_hex(&hex) else {
            continue;
        };
        if bytes.len() >= 2 && bytes[0] == 0x41 && bytes[1] == pid {
            return Ok(Some(bytes[2..].to_vec()));
        }
    }

    Err(SourceError::QueryFailed(format!(
        "no response for PID {pid:02X}"
    )))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

#[async_trait]
impl TelemetrySource for Elm327Source {
    fn name(&self) -> &str {
        &self.label
    }

    async fn query(
        &self,
        command: &CommandDescriptor,
        timeout: Duration,
    ) -> Result<Option<f64>, SourceError> {
        let raw = self.exchange(&command.request(), timeout).await?;
        match parse_response(&raw, command.pid())? {
            None => Ok(None),
            Some(data) => command.decode(&data).map(Some).ok_or_else(|| {
                SourceError::QueryFailed(format!("short response for {}", command.name()))
            }),
        }
    }

    async fn close(&self) -> Result<(), SourceError> {
        let mut link = self.link.lock().await;
        if let Some(mut stream) = link.take() {
            stream.shutdown().await?;
            info!(source = %self.label, "ELM327 link closed");
        }
        Ok(())
    }
}

/// Connects a new [`Elm327Source`] per session
#[derive(Clone, Debug)]
pub struct Elm327Factory {
    address: String,
    connect_timeout: Duration,
}

impl Elm327Factory {
    /// Create a factory for the adapter at `address` (`host:port`)
    #[must_use]
    pub fn new(address: String, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SourceFactory for Elm327Factory {
    async fn open(&self) -> Result<Arc<dyn TelemetrySource>, SourceError> {
        let source = Elm327Source::connect(&self.address, self.connect_timeout).await?;
        Ok(Arc::new(source))
    }
}
