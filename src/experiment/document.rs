//! Document Model for structured run data
//!
//! Bluesky-style documents decouple plan execution from whoever consumes the
//! results (local callbacks, the network relay, storage):
//!
//! - **StartDoc**: Run intent and metadata
//! - **DescriptorDoc**: Schema for one data stream
//! - **EventDoc**: Values read at one point
//! - **StopDoc**: Completion status and summary
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per data stream)
//!    │       │
//!    │       └── EventDoc (N, measurements)
//!    │
//! StopDoc (1)
//! ```
//!
//! Documents are immutable once emitted. Each kind serializes to a compact
//! JSON payload that [`Document::from_payload`] parses back exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Document kind, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Opens a run.
    Start,
    /// Declares a stream's data keys.
    Descriptor,
    /// One bundle of readings.
    Event,
    /// Closes a run.
    Stop,
}

impl DocumentKind {
    /// Every kind, in emission order within a run.
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Start,
        DocumentKind::Descriptor,
        DocumentKind::Event,
        DocumentKind::Stop,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Start => "start",
            DocumentKind::Descriptor => "descriptor",
            DocumentKind::Event => "event",
            DocumentKind::Stop => "stop",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Document types for run data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Start of a run.
    Start(StartDoc),
    /// Schema of a stream.
    Descriptor(DescriptorDoc),
    /// Readings for one bundle.
    Event(EventDoc),
    /// End of a run.
    Stop(StopDoc),
}

impl Document {
    /// Kind tag of this document.
    pub fn kind(&self) -> DocumentKind {
        match self {
            Document::Start(_) => DocumentKind::Start,
            Document::Descriptor(_) => DocumentKind::Descriptor,
            Document::Event(_) => DocumentKind::Event,
            Document::Stop(_) => DocumentKind::Stop,
        }
    }

    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Creation time in nanoseconds since the Unix epoch.
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::Start(d) => d.time_ns,
            Document::Descriptor(d) => d.time_ns,
            Document::Event(d) => d.time_ns,
            Document::Stop(d) => d.time_ns,
        }
    }

    /// Encode the document body (without the kind tag) as compact JSON.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        match self {
            Document::Start(d) => serde_json::to_string(d),
            Document::Descriptor(d) => serde_json::to_string(d),
            Document::Event(d) => serde_json::to_string(d),
            Document::Stop(d) => serde_json::to_string(d),
        }
    }

    /// Parse a payload produced by [`Document::to_payload`] for `kind`.
    pub fn from_payload(kind: DocumentKind, payload: &str) -> serde_json::Result<Self> {
        Ok(match kind {
            DocumentKind::Start => Document::Start(serde_json::from_str(payload)?),
            DocumentKind::Descriptor => Document::Descriptor(serde_json::from_str(payload)?),
            DocumentKind::Event => Document::Event(serde_json::from_str(payload)?),
            DocumentKind::Stop => Document::Stop(serde_json::from_str(payload)?),
        })
    }
}

/// Start document - emitted by `open_run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Timestamp when run started
    pub time_ns: u64,
    /// Metadata supplied with `open_run`
    pub metadata: BTreeMap<String, Value>,
}

impl StartDoc {
    /// Fresh start document stamped with the current time.
    pub fn new() -> Self {
        Self {
            uid: new_uid(),
            time_ns: now_ns(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

impl Default for StartDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor document - defines schema for event data
///
/// Emitted the first time a stream is saved. A run can have several streams
/// (e.g., "primary", "baseline").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name
    pub name: String,
    /// Schema for data fields
    pub data_keys: BTreeMap<String, DataKey>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// Descriptor for stream `name` of run `run_uid`.
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add one data key.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type; signals are always "number"
    pub dtype: String,
    /// Source signal name
    pub source: String,
    /// Physical units
    pub units: Option<String>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str, units: Option<&str>) -> Self {
        Self {
            dtype: "number".to_string(),
            source: source.to_string(),
            units: units.map(str::to_string),
        }
    }
}

/// Event document - values read between `create` and `save`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc (for quick run lookup)
    pub run_uid: String,
    /// Links to DescriptorDoc that defines schema
    pub descriptor_uid: String,
    /// Event sequence number within this descriptor stream, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Scalar data values (field name -> value). NaN and infinities are
    /// carried as the strings `"NaN"`, `"inf"` and `"-inf"`.
    #[serde(with = "readings")]
    pub data: BTreeMap<String, f64>,
    /// Per-field timestamps (field name -> timestamp_ns)
    pub timestamps: BTreeMap<String, u64>,
}

impl EventDoc {
    /// Empty event; readings are added with [`EventDoc::with_datum`].
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    /// Add one reading and its timestamp.
    pub fn with_datum(mut self, field: &str, value: f64, timestamp_ns: u64) -> Self {
        self.data.insert(field.to_string(), value);
        self.timestamps.insert(field.to_string(), timestamp_ns);
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Plan finished or was stopped.
    Success,
    /// Plan was aborted.
    Abort,
    /// An instruction failed.
    Fail,
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// How the run ended
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Total events emitted
    pub num_events: u32,
}

impl StopDoc {
    /// Stop document with an explicit status.
    pub fn new(run_uid: &str, exit_status: ExitStatus, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Stop document for a run that finished normally.
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Success, "", num_events)
    }

    /// Stop document for an aborted run.
    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::new(run_uid, ExitStatus::Abort, reason, num_events)
    }
}

/// JSON has no non-finite numbers; a disconnected detector still reports them.
mod readings {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Reading {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(
        values: &BTreeMap<String, f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(values.iter().map(|(field, &value)| {
            let reading = if value.is_nan() {
                Reading::Text("NaN".to_string())
            } else if value == f64::INFINITY {
                Reading::Text("inf".to_string())
            } else if value == f64::NEG_INFINITY {
                Reading::Text("-inf".to_string())
            } else {
                Reading::Number(value)
            };
            (field, reading)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, f64>, D::Error> {
        BTreeMap::<String, Reading>::deserialize(deserializer)?
            .into_iter()
            .map(|(field, reading)| {
                let value = match reading {
                    Reading::Number(value) => value,
                    Reading::Text(text) => match text.as_str() {
                        "NaN" => f64::NAN,
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        other => {
                            return Err(D::Error::custom(format!(
                                "invalid reading '{other}' for field '{field}'"
                            )))
                        }
                    },
                };
                Ok((field, value))
            })
            .collect()
    }
}
