use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `type` tag of the frames that acknowledge a submitted command.
pub const COMMAND_RESPONSE: &str = "command_response";

/// One inbound frame from the tenant channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    CommandResponse(CommandAck),
    /// Frames meant for other consumers of the same channel.
    Other { kind: String, body: Value },
}

impl ChannelFrame {
    pub fn kind(&self) -> &str {
        match self {
            ChannelFrame::CommandResponse(_) => COMMAND_RESPONSE,
            ChannelFrame::Other { kind, .. } => kind,
        }
    }
}

/// Acknowledgment relayed by the backend once the controller answered
/// (or the backend gave up waiting for it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub message_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
}

impl CommandAck {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            status: AckStatus::Ok,
            error: None,
            command_type: None,
        }
    }

    pub fn error(message_id: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            message_id: message_id.into(),
            status: AckStatus::Error,
            error: Some(error),
            command_type: None,
        }
    }

    /// Human readable rejection reason.
    pub fn reason(&self) -> String {
        match &self.error {
            Some(detail) => detail.describe(),
            None => "device reported an error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Success,
    Error,
    /// The backend's own command deadline elapsed.
    Timeout,
}

impl AckStatus {
    pub fn is_success(self) -> bool {
        matches!(self, AckStatus::Ok | AckStatus::Success)
    }
}

/// Controllers report either a free-form message or a small integer code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Code(i64),
    Message(String),
}

impl ErrorDetail {
    /// Numeric codes are explained whether they arrive as integers or as
    /// the stringified codes the backend relays.
    pub fn describe(&self) -> String {
        match self {
            ErrorDetail::Code(code) => describe_code(*code),
            ErrorDetail::Message(message) => match message.trim().parse::<i64>() {
                Ok(code) => describe_code(code),
                Err(_) => message.clone(),
            },
        }
    }
}

fn describe_code(code: i64) -> String {
    let meaning = match code {
        -1 => Some("general error or command not recognized"),
        -2 => Some("invalid parameters"),
        -3 => Some("device busy or unable to process"),
        _ => None,
    };
    match meaning {
        Some(meaning) => format!("error code {code} ({meaning})"),
        None => format!("error code {code}"),
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("invalid {kind} frame: {source}")]
    Shape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parses one text frame received on the channel.
pub fn parse_frame(text: &str) -> Result<ChannelFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    if kind == COMMAND_RESPONSE {
        let ack = serde_json::from_value::<CommandAck>(value)
            .map_err(|source| FrameError::Shape { kind, source })?;
        return Ok(ChannelFrame::CommandResponse(ack));
    }

    Ok(ChannelFrame::Other { kind, body: value })
}

/// Renders an acknowledgment the way the backend pushes it.
pub fn encode_ack(ack: &CommandAck) -> String {
    let mut value = serde_json::to_value(ack).unwrap_or_else(|_| Value::Object(Default::default()));
    if let Value::Object(map) = &mut value {
        map.insert("type".into(), Value::String(COMMAND_RESPONSE.into()));
    }
    value.to_string()
}
