//! Cache control protocol.
//!
//! A request is a [`WorkerMessage`](crate::WorkerMessage) whose data is a bare
//! command tag string and whose first port is the reply port. Replies are a
//! JSON array of URLs or a JSON boolean.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ChannelError;

/// Commands understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// List the request URLs stored in the current cache.
    GetCacheContents,
    /// Delete the current cache.
    ClearCache,
}

impl ControlCommand {
    /// Wire tag for this command.
    pub fn as_tag(&self) -> &'static str {
        match self {
            ControlCommand::GetCacheContents => "GET_CACHE_CONTENTS",
            ControlCommand::ClearCache => "CLEAR_CACHE",
        }
    }

    /// Parse message data. Anything but a known tag string yields `None`.
    pub fn from_message(data: &JsonValue) -> Option<Self> {
        match data.as_str()? {
            "GET_CACHE_CONTENTS" => Some(ControlCommand::GetCacheContents),
            "CLEAR_CACHE" => Some(ControlCommand::ClearCache),
            _ => None,
        }
    }

    /// Message data for this command.
    pub fn to_message(&self) -> JsonValue {
        JsonValue::String(self.as_tag().to_string())
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Reply payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    /// Stored request URLs, in cache order.
    CacheContents(Vec<String>),
    /// Whether a cache existed and was deleted.
    Cleared(bool),
}

impl ControlReply {
    /// Reply data as posted on the port.
    pub fn to_message(&self) -> JsonValue {
        match self {
            ControlReply::CacheContents(urls) => {
                JsonValue::Array(urls.iter().cloned().map(JsonValue::String).collect())
            }
            ControlReply::Cleared(deleted) => JsonValue::Bool(*deleted),
        }
    }

    /// Decode reply data for a given command.
    pub fn from_message(command: ControlCommand, data: JsonValue) -> Result<Self, ChannelError> {
        let reply: ControlReply = serde_json::from_value(data.clone())
            .map_err(|_| ChannelError::UnexpectedReply(data.to_string()))?;

        match (command, &reply) {
            (ControlCommand::GetCacheContents, ControlReply::CacheContents(_))
            | (ControlCommand::ClearCache, ControlReply::Cleared(_)) => Ok(reply),
            _ => Err(ChannelError::UnexpectedReply(format!(
                "{data} for {command}"
            ))),
        }
    }
}
