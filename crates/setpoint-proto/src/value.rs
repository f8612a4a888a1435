use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a PLC data point is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    Number,
    Boolean,
    Textlist,
}

/// Value held by a settings or control row. The wire carries every kind as
/// a nullable float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetpointValue {
    Number(f64),
    Flag(bool),
    /// Enumerated code picked from a text list.
    Code(i64),
    Unset,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueParseError {
    #[error("`{0}` is not a number")]
    NotNumber(String),
    #[error("`{0}` is not a boolean (use on/off, true/false or 1/0)")]
    NotBoolean(String),
    #[error("`{0}` is not an integer code")]
    NotCode(String),
}

impl SetpointValue {
    pub fn from_wire(input_type: InputType, data: Option<f64>) -> Self {
        let Some(data) = data else {
            return SetpointValue::Unset;
        };
        match input_type {
            InputType::Number => SetpointValue::Number(data),
            InputType::Boolean => SetpointValue::Flag(data != 0.0),
            InputType::Textlist => SetpointValue::Code(data.round() as i64),
        }
    }

    pub fn to_wire(self) -> Option<f64> {
        match self {
            SetpointValue::Number(value) => Some(value),
            SetpointValue::Flag(flag) => Some(if flag { 1.0 } else { 0.0 }),
            SetpointValue::Code(code) => Some(code as f64),
            SetpointValue::Unset => None,
        }
    }

    /// Parses operator input for a row of the given kind. An empty string clears the value.
    pub fn parse(input_type: InputType, text: &str) -> Result<Self, ValueParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
            return Ok(SetpointValue::Unset);
        }
        match input_type {
            InputType::Number => trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(SetpointValue::Number)
                .ok_or_else(|| ValueParseError::NotNumber(trimmed.to_string())),
            InputType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(SetpointValue::Flag(true)),
                "0" | "false" | "off" | "no" => Ok(SetpointValue::Flag(false)),
                _ => Err(ValueParseError::NotBoolean(trimmed.to_string())),
            },
            InputType::Textlist => trimmed
                .parse::<i64>()
                .map(SetpointValue::Code)
                .map_err(|_| ValueParseError::NotCode(trimmed.to_string())),
        }
    }
}

impl fmt::Display for SetpointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetpointValue::Number(value) => write!(f, "{value}"),
            SetpointValue::Flag(true) => f.write_str("on"),
            SetpointValue::Flag(false) => f.write_str("off"),
            SetpointValue::Code(code) => write!(f, "#{code}"),
            SetpointValue::Unset => f.write_str("-"),
        }
    }
}
