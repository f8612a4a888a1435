use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::InputType;

/// `202 Accepted` body returned by command-backed bulk updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReceipt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(alias = "correlationToken", alias = "correlation_token")]
    pub message_id: String,
}

/// A bulk update either hands back a correlation token or the rows it already applied.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BulkUpdateResponse<R> {
    Accepted(CommandReceipt),
    Applied(Vec<R>),
}

/// PLC data settings / control row as served by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcDataRow {
    pub id: i64,
    pub plant_id: i64,
    #[serde(alias = "control_type")]
    pub device_id: i64,
    pub data_id: i64,
    pub data: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub device_text: Option<String>,
    #[serde(default)]
    pub data_text: Option<String>,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default)]
    pub textlist_entries: Option<BTreeMap<String, String>>,
}

impl PlcDataRow {
    pub fn label(&self) -> String {
        match (&self.device_text, &self.data_text) {
            (Some(device), Some(data)) => format!("{device} / {data}"),
            (None, Some(data)) => data.clone(),
            (Some(device), None) => format!("{device} / data {}", self.data_id),
            (None, None) => format!("data {}", self.data_id),
        }
    }
}

/// Body element for `PUT` on settings and control endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataUpdate {
    pub id: i64,
    pub data: Option<f64>,
}

/// Editable part of one schedule slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub rec_no: i64,
    pub start_time: String,
    pub charge_from_grid: bool,
    pub allow_to_sell: bool,
    pub charge_power: f64,
    pub charge_limit: f64,
    pub discharge_power: f64,
    pub source: i64,
}

/// Schedule row as exchanged with `/schedule`. New rows carry a non-positive id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: i64,
    #[serde(flatten)]
    pub slot: ScheduleSlot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}
