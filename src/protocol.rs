//! Wire envelope shared by agent and hub.
//!
//! Every frame is a JSON object of the shape
//!
//! ```text
//! { "type": "...", "token": "...", "server_name": "...", "data": {...}, "timestamp": "RFC3339" }
//! ```
//!
//! Decoding happens in two stages: the envelope and its discriminant are
//! read first with `data` kept as raw JSON, then the payload is parsed
//! into the type selected by the discriminant. A well-formed envelope
//! carrying an unknown discriminant or a broken payload therefore yields a
//! precise [`ProtocolError`] instead of a generic parse failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, value::RawValue};
use thiserror::Error;

use crate::{AlertEvent, MetricSample};

pub const METRICS: &str = "metrics";
pub const ALERT: &str = "alert";
pub const CONFIG_UPDATE: &str = "config_update";
pub const COMMAND: &str = "command";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("message type `{0}` carries no data")]
    MissingData(String),

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Typed body of an [`Envelope`], selected by the `type` discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Metrics(MetricSample),
    Alert(AlertEvent),
    /// Reserved for hub-to-agent configuration pushes.
    ConfigUpdate(Value),
    /// Reserved for hub-to-agent commands.
    Command(Value),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Metrics(_) => METRICS,
            Payload::Alert(_) => ALERT,
            Payload::ConfigUpdate(_) => CONFIG_UPDATE,
            Payload::Command(_) => COMMAND,
        }
    }

    /// Build a payload from a discriminant and its raw `data`.
    pub fn from_parts(kind: &str, data: Option<&RawValue>) -> Result<Self, ProtocolError> {
        fn typed<T: for<'de> Deserialize<'de>>(
            kind: &str,
            data: Option<&RawValue>,
        ) -> Result<T, ProtocolError> {
            let raw = data.ok_or_else(|| ProtocolError::MissingData(kind.to_string()))?;
            serde_json::from_str(raw.get()).map_err(|source| ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                source,
            })
        }

        match kind {
            METRICS => typed(kind, data).map(Payload::Metrics),
            ALERT => typed(kind, data).map(Payload::Alert),
            // reserved kinds accept any (or no) data
            CONFIG_UPDATE => Ok(Payload::ConfigUpdate(
                data.map(|raw| typed(kind, Some(raw))).transpose()?.unwrap_or(Value::Null),
            )),
            COMMAND => Ok(Payload::Command(
                data.map(|raw| typed(kind, Some(raw))).transpose()?.unwrap_or(Value::Null),
            )),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    fn data(&self) -> Result<Box<RawValue>, ProtocolError> {
        let raw = match self {
            Payload::Metrics(sample) => serde_json::value::to_raw_value(sample),
            Payload::Alert(alert) => serde_json::value::to_raw_value(alert),
            Payload::ConfigUpdate(value) | Payload::Command(value) => {
                serde_json::value::to_raw_value(value)
            }
        };
        raw.map_err(ProtocolError::Encode)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub token: String,
    pub server_name: String,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Incoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    data: Option<Box<RawValue>>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct Outgoing<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    token: &'a str,
    server_name: &'a str,
    data: &'a RawValue,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(token: impl Into<String>, server_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            token: token.into(),
            server_name: server_name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = self.payload.data()?;
        let outgoing = Outgoing {
            kind: self.kind(),
            token: &self.token,
            server_name: &self.server_name,
            data: &data,
            timestamp: self.timestamp,
        };
        serde_json::to_string(&outgoing).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let incoming: Incoming = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let payload = Payload::from_parts(&incoming.kind, incoming.data.as_deref())?;
        Ok(Self {
            token: incoming.token,
            server_name: incoming.server_name,
            payload,
            timestamp: incoming.timestamp,
        })
    }
}
