//! Messages flowing through worker dispatch.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::execution::{Execution, ExecutionCodec};
use crate::error::AppResult;

/// A start/continue message wrapping a serialized execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    /// Correlation id, the execution id of the payload.
    pub msg_id: String,

    /// Serialized execution, base64 on the wire.
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

impl ExecutionMessage {
    pub fn new(msg_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            payload,
        }
    }

    /// Build the message that starts or resumes `execution`.
    pub fn from_execution(codec: &dyn ExecutionCodec, execution: &Execution) -> AppResult<Self> {
        Ok(Self::new(
            execution.execution_id.to_string(),
            codec.serialize(execution)?,
        ))
    }
}

/// A fork instruction: suspend `parent` and start one branch per child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitMessage {
    pub split_id: String,
    pub parent: Execution,
    pub children: Vec<Execution>,
}

/// Message kinds accepted by the dispatch gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchMessage {
    Execution(ExecutionMessage),
    Split(SplitMessage),
    /// Any kind this version does not understand; dropped at dispatch.
    #[serde(other)]
    Unknown,
}

impl DispatchMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchMessage::Execution(_) => "execution",
            DispatchMessage::Split(_) => "split",
            DispatchMessage::Unknown => "unknown",
        }
    }
}

mod base64_payload {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
