use std::collections::BTreeSet;

use thiserror::Error;

use crate::channel::ConnectionState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name}={value} is not a valid {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("invalid api base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme `{0}`")]
    Scheme(String),
    #[error("no tenant id configured (set SETPOINT_TENANT_ID)")]
    MissingTenant,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not open (state: {0:?})")]
    NotOpen(ConnectionState),
    #[error("channel connection closed while sending")]
    Closed,
    #[error(transparent)]
    InvalidUrl(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("another command is still awaiting its acknowledgment")]
    InFlight,
    #[error("bulk update failed: {0}")]
    Transport(#[from] ApiError),
    #[error("correlator was shut down")]
    Disposed,
}

/// Rows that must be fixed locally before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} row(s) failed validation: {:?}", .invalid.len(), .invalid)]
pub struct ValidationError {
    pub invalid: BTreeSet<i64>,
}
