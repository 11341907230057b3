//! Relay addresses, document origins and the broadcast record format.
//!
//! One record per document, one record per line:
//!
//! ```text
//! <hostname> <pid> <engine-id> <kind> <payload>
//! ```
//!
//! The payload is the compact JSON encoding of the [`Document`], which never
//! contains a raw newline. The four header fields never contain spaces.
//! Readers accept records up to [`MAX_RECORD_BYTES`] long; longer lines are
//! skipped up to the next newline.

use crate::error::{TransportError, WireError};
use crate::experiment::document::{Document, DocumentKind};
use crate::experiment::run_engine::EngineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest record a reader accepts, newline excluded.
pub const MAX_RECORD_BYTES: usize = 1 << 20;

/// `host:port` of a Proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayAddress {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl RelayAddress {
    /// Address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for RelayAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::Address(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for RelayAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Anything that names a relay endpoint.
pub trait ToRelayAddress {
    /// Resolve to a [`RelayAddress`].
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError>;
}

impl ToRelayAddress for RelayAddress {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        Ok(self.clone())
    }
}

impl ToRelayAddress for str {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        self.parse()
    }
}

impl ToRelayAddress for String {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        self.parse()
    }
}

impl ToRelayAddress for (&str, u16) {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        Ok(RelayAddress::new(self.0, self.1))
    }
}

impl ToRelayAddress for (String, u16) {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        Ok(RelayAddress::new(self.0.clone(), self.1))
    }
}

impl ToRelayAddress for SocketAddr {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        Ok((*self).into())
    }
}

impl<T: ToRelayAddress + ?Sized> ToRelayAddress for &T {
    fn to_relay_address(&self) -> Result<RelayAddress, TransportError> {
        (**self).to_relay_address()
    }
}

/// Who published a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Host name with whitespace replaced.
    pub hostname: String,
    /// Process id.
    pub pid: u32,
    /// Engine identity.
    pub engine_id: String,
}

impl Origin {
    /// Origin for an engine in this process.
    pub fn local(engine: EngineId) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname: header_field(&hostname),
            pid: std::process::id(),
            engine_id: engine.to_string(),
        }
    }
}

fn header_field(value: &str) -> String {
    if value.is_empty() {
        return "-".to_string();
    }
    value
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Origin filter; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginFilter {
    /// Required host name.
    pub hostname: Option<String>,
    /// Required process id.
    pub pid: Option<u32>,
    /// Required engine id.
    pub engine_id: Option<String>,
}

impl OriginFilter {
    /// Filter accepting every origin.
    pub fn any() -> Self {
        Self::default()
    }

    /// Require a host name.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Require a process id.
    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Require an engine id.
    pub fn engine(mut self, engine: impl ToString) -> Self {
        self.engine_id = Some(engine.to_string());
        self
    }

    /// Whether `origin` passes every set field.
    pub fn matches(&self, origin: &Origin) -> bool {
        self.hostname.as_ref().map_or(true, |h| *h == origin.hostname)
            && self.pid.map_or(true, |p| p == origin.pid)
            && self
                .engine_id
                .as_ref()
                .map_or(true, |e| *e == origin.engine_id)
    }
}

/// A parsed broadcast record.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    /// Publisher of the record.
    pub origin: Origin,
    /// Document kind from the header.
    pub kind: DocumentKind,
    /// Decoded document.
    pub document: Document,
}

/// Encode one document as a single line, without the trailing newline.
pub fn encode(origin: &Origin, kind: DocumentKind, document: &Document) -> Result<String, WireError> {
    let payload = document.to_payload()?;
    Ok(format!(
        "{} {} {} {} {}",
        origin.hostname, origin.pid, origin.engine_id, kind, payload
    ))
}

/// Split a record into its origin, kind and still-encoded payload.
pub fn split(line: &str) -> Result<(Origin, DocumentKind, &str), WireError> {
    let mut fields = line.splitn(5, ' ');
    let hostname = fields.next().filter(|f| !f.is_empty()).ok_or(WireError::MissingField("hostname"))?;
    let pid = fields.next().ok_or(WireError::MissingField("pid"))?;
    let engine_id = fields.next().ok_or(WireError::MissingField("engine id"))?;
    let kind = fields.next().ok_or(WireError::MissingField("kind"))?;
    let payload = fields.next().ok_or(WireError::MissingField("payload"))?;

    let pid = pid.parse().map_err(|_| WireError::BadPid(pid.to_string()))?;
    let kind = kind
        .parse()
        .map_err(|_| WireError::UnknownKind(kind.to_string()))?;
    let origin = Origin {
        hostname: hostname.to_string(),
        pid,
        engine_id: engine_id.to_string(),
    };
    Ok((origin, kind, payload))
}

/// Parse a complete record.
pub fn decode(line: &str) -> Result<WireRecord, WireError> {
    let (origin, kind, payload) = split(line)?;
    let document = Document::from_payload(kind, payload)?;
    Ok(WireRecord {
        origin,
        kind,
        document,
    })
}

/// Result of [`read_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRead {
    /// A record is in the buffer, newline stripped.
    Record,
    /// A line longer than the limit was skipped; carries its length.
    Oversize(usize),
    /// The peer closed the connection.
    Closed,
}

/// Read one newline-terminated record into `buf` without holding more than
/// `limit` bytes of it. An oversize line is consumed and discarded so the
/// reader stays aligned on the next record.
pub async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<RecordRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut skipped: Option<usize> = None;
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match skipped {
                    Some(len) => RecordRead::Oversize(len),
                    None if buf.is_empty() => RecordRead::Closed,
                    None => RecordRead::Record,
                });
            }
            let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };
            match skipped.as_mut() {
                Some(len) => *len += chunk.len(),
                None if buf.len() + chunk.len() > limit => {
                    skipped = Some(buf.len() + chunk.len());
                    buf.clear();
                }
                None => buf.extend_from_slice(chunk),
            }
            (used, done)
        };
        reader.consume(used);
        if done {
            return Ok(match skipped {
                Some(len) => RecordRead::Oversize(len),
                None => RecordRead::Record,
            });
        }
    }
}
