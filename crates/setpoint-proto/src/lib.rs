//! Shared protocol definitions for setpoint editors.
//! Keeping these in a dedicated crate lets other clients (web, tooling)
//! mirror the message contract without pulling in the tokio runtime code.

mod frame;
mod rest;
mod value;

pub use frame::{
    encode_ack, parse_frame, AckStatus, ChannelFrame, CommandAck, ErrorDetail, FrameError,
    COMMAND_RESPONSE,
};
pub use rest::{
    BulkUpdateResponse, CommandReceipt, DataUpdate, PlcDataRow, ScheduleRecord, ScheduleSlot,
};
pub use value::{InputType, SetpointValue, ValueParseError};
