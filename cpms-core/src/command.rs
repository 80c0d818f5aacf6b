//! Command request/response envelopes exchanged with the business layer

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::BusMessage;
use crate::events::topics;

/// Outbound command requested by the business layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub charger_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Correlation key for the response; no response is published without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_key: Option<String>,
}

impl CommandRequest {
    pub fn new(charger_id: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        Self {
            charger_id: charger_id.into(),
            action: action.into(),
            params,
            response_key: None,
        }
    }

    pub fn with_response_key(mut self, key: impl Into<String>) -> Self {
        self.response_key = Some(key.into());
        self
    }

    /// Bus message on the command request topic
    pub fn to_message(&self, topic: &str) -> Result<BusMessage, serde_json::Error> {
        Ok(BusMessage::keyed(topic, &self.charger_id, serde_json::to_value(self)?))
    }
}

/// Outcome of a command, published once per keyed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub response_key: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Stable error code, e.g. `NotConnected` or `CommandTimeout`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    pub charger_id: String,
    pub action: String,
}

impl CommandResponse {
    pub fn success(request: &CommandRequest, response_key: impl Into<String>, result: Value) -> Self {
        Self {
            response_key: response_key.into(),
            success: true,
            result: Some(result),
            error: None,
            error_description: None,
            charger_id: request.charger_id.clone(),
            action: request.action.clone(),
        }
    }

    pub fn failure(
        request: &CommandRequest,
        response_key: impl Into<String>,
        error: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            response_key: response_key.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            error_description: Some(description.into()),
            charger_id: request.charger_id.clone(),
            action: request.action.clone(),
        }
    }

    /// Bus message on the given response topic, keyed by `responseKey`
    pub fn to_message(&self, topic: &str) -> Result<BusMessage, serde_json::Error> {
        Ok(BusMessage::keyed(
            topic,
            &self.response_key,
            serde_json::to_value(self)?,
        ))
    }

    /// Same as [`to_message`](Self::to_message) on the default topic
    pub fn to_default_message(&self) -> Result<BusMessage, serde_json::Error> {
        self.to_message(topics::COMMAND_RESPONSE)
    }
}
