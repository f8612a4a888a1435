//! Client side of remotely applied configuration edits.
//!
//! Rows fetched over REST are mirrored into a [`RowBuffer`]; only the rows an
//! operator changed are sent back as one bulk command. The backend answers
//! with a correlation token and the controller's acknowledgment arrives later
//! on the tenant's [`CommandChannel`], where the [`CommandCorrelator`] matches
//! it. [`EditSession`] ties these together into the `Idle -> Sending ->
//! Success | Failed` cycle shown to the operator.

pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod rows;
pub mod schedule;
pub mod session;
pub mod store;

pub use channel::{CommandChannel, ConnectionState, ReconnectPolicy, SHUTDOWN_REASON};
pub use config::EditorConfig;
pub use correlator::{CommandCorrelator, CommandOutcome};
pub use error::{ApiError, ChannelError, ConfigError, SubmitError, ValidationError};
pub use rows::{AcceptAll, Row, RowBuffer, RowValidator, RowValue, ServerRow};
pub use schedule::ScheduleValidator;
pub use session::{EditSession, EditState, FailureReason, SuccessKind};
pub use store::{
    ApiClient, BulkUpdate, MemoryStore, PlcDataKind, PlcDataStore, RowStore, ScheduleStore,
};

pub use setpoint_proto as proto;
