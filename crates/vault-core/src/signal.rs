//! Source-specific processors that turn raw exports into structured signals.
//!
//! Every recognized [`DataSource`] maps to exactly one processor; callers
//! pick it by tag with [`DataSource::processor`].

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::time::Timestamp;

/// A structured signal. Always carries a `type` key naming its source.
pub type Signal = Map<String, Value>;

pub const DEFAULT_QUALITY: f64 = 1.0;

static ANGLE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([^<>\s]+)>").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Spotify,
    Gmail,
}

impl DataSource {
    pub const ALL: [DataSource; 2] = [DataSource::Spotify, DataSource::Gmail];

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Spotify => "spotify",
            DataSource::Gmail => "gmail",
        }
    }

    pub fn processor(self) -> &'static dyn SignalProcessor {
        static SPOTIFY: SpotifyProcessor = SpotifyProcessor;
        static GMAIL: GmailProcessor = GmailProcessor;
        match self {
            DataSource::Spotify => &SPOTIFY,
            DataSource::Gmail => &GMAIL,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DataSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| Error::invalid(format!("unknown data source '{s}'")))
    }
}

pub trait SignalProcessor: Send + Sync {
    fn source(&self) -> DataSource;

    /// Extract this source's fields from a raw export. Missing fields become
    /// empty sequences.
    fn process(&self, raw: &Map<String, Value>) -> Signal;

    /// Whether `signal` has every field this source requires.
    fn validate(&self, signal: &Signal) -> bool {
        signal.get("type").and_then(Value::as_str) == Some(self.source().as_str())
            && self
                .required_fields()
                .iter()
                .all(|field| signal.get(*field).is_some_and(Value::is_array))
    }

    fn required_fields(&self) -> &'static [&'static str];

    fn score_quality(&self, _signal: &Signal) -> f64 {
        DEFAULT_QUALITY
    }
}

fn sequence(raw: &Map<String, Value>, field: &str) -> Value {
    match raw.get(field) {
        Some(Value::Array(items)) => Value::Array(items.clone()),
        _ => Value::Array(Vec::new()),
    }
}

fn extract(source: DataSource, raw: &Map<String, Value>, fields: &[&str]) -> Signal {
    let mut signal = Signal::new();
    signal.insert("type".into(), Value::from(source.as_str()));
    for field in fields {
        signal.insert((*field).to_string(), sequence(raw, field));
    }
    signal
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpotifyProcessor;

impl SignalProcessor for SpotifyProcessor {
    fn source(&self) -> DataSource {
        DataSource::Spotify
    }

    fn process(&self, raw: &Map<String, Value>) -> Signal {
        extract(self.source(), raw, self.required_fields())
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["tracks", "artists", "playlists"]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GmailProcessor;

impl SignalProcessor for GmailProcessor {
    fn source(&self) -> DataSource {
        DataSource::Gmail
    }

    fn process(&self, raw: &Map<String, Value>) -> Signal {
        let mut signal = extract(self.source(), raw, self.required_fields());
        if let Some(Value::Array(contacts)) = signal.get_mut("contacts") {
            let mut seen = Vec::new();
            for contact in contacts.drain(..) {
                let contact = match contact {
                    Value::String(s) => Value::String(normalize_contact(&s)),
                    other => other,
                };
                if !seen.contains(&contact) {
                    seen.push(contact);
                }
            }
            *contacts = seen;
        }
        signal
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["emails", "contacts", "labels"]
    }
}

/// `"Ada Lovelace <Ada@Example.org>"` becomes `"ada@example.org"`.
pub fn normalize_contact(contact: &str) -> String {
    let address = ANGLE_ADDRESS
        .captures(contact)
        .and_then(|c| c.get(1))
        .map_or(contact, |m| m.as_str());
    address.trim().to_lowercase()
}

/// Accumulated output of one processor, serializable as a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorLog {
    pub processor: DataSource,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub data: Vec<Signal>,
    /// Quality score of each entry in `data`, by position.
    #[serde(default)]
    pub quality_scores: Vec<f64>,
}

impl ProcessorLog {
    pub fn new(processor: DataSource) -> Self {
        Self {
            processor,
            timestamp: Timestamp::now(),
            data: Vec::new(),
            quality_scores: Vec::new(),
        }
    }

    /// Process, validate and score one raw export, appending it to the log.
    pub fn ingest(&mut self, raw: &Map<String, Value>) -> Result<(Signal, f64)> {
        let processor = self.processor.processor();
        let signal = processor.process(raw);
        if !processor.validate(&signal) {
            return Err(Error::invalid(format!(
                "{} signal is missing required fields",
                self.processor
            )));
        }
        let quality = processor.score_quality(&signal);
        self.data.push(signal.clone());
        self.quality_scores.push(quality);
        self.timestamp = Timestamp::now();
        tracing::debug!(source = %self.processor, quality, entries = self.data.len(), "signal ingested");
        Ok((signal, quality))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::invalid(format!("encoding processor log: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::invalid(format!("decoding processor log: {e}")))
    }
}
