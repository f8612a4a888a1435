use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use setpoint_proto::{
    BulkUpdateResponse, DataUpdate, PlcDataRow, ScheduleRecord, ScheduleSlot, SetpointValue,
};
use time::Date;
use tracing::debug;
use uuid::Uuid;

use super::{BulkUpdate, RowStore};
use crate::config::EditorConfig;
use crate::error::ApiError;
use crate::rows::{Row, ServerRow};

/// Thin bearer-authenticated JSON client for the REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_config(config: &EditorConfig) -> Self {
        Self::new(config.api_url(), config.token.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let res = self.request(Method::GET, path).query(query).send().await?;
        decode(res).await
    }

    pub async fn put_json<B, T>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &B,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let res = self
            .request(Method::PUT, path)
            .query(query)
            .json(body)
            .send()
            .await?;
        decode(res).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(target = "setpoint::store", %method, url = %url, "api request");
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn decode<T: DeserializeOwned>(res: Response) -> Result<T, ApiError> {
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(ApiError::UnexpectedStatus { status, body })
    }
}

fn into_update<V>(response: BulkUpdateResponse<impl Into<ServerRow<V>>>) -> BulkUpdate<V> {
    match response {
        BulkUpdateResponse::Accepted(receipt) => {
            debug!(
                target = "setpoint::store",
                token = %receipt.message_id,
                message = receipt.message.as_deref().unwrap_or(""),
                "bulk update accepted"
            );
            BulkUpdate::Pending {
                correlation_token: receipt.message_id,
            }
        }
        BulkUpdateResponse::Applied(rows) => {
            BulkUpdate::Applied(rows.into_iter().map(Into::into).collect())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlcDataKind {
    Settings,
    Control,
}

impl PlcDataKind {
    pub fn path(self) -> &'static str {
        match self {
            PlcDataKind::Settings => "/settings/plc-data-settings",
            PlcDataKind::Control => "/control/plc-data-control",
        }
    }
}

impl From<PlcDataRow> for ServerRow<SetpointValue> {
    fn from(row: PlcDataRow) -> Self {
        ServerRow::new(row.id, SetpointValue::from_wire(row.input_type, row.data))
    }
}

/// PLC data settings or controls of one tenant.
#[derive(Clone)]
pub struct PlcDataStore {
    client: ApiClient,
    kind: PlcDataKind,
    tenant_id: Uuid,
}

impl PlcDataStore {
    pub fn new(client: ApiClient, kind: PlcDataKind, tenant_id: Uuid) -> Self {
        Self {
            client,
            kind,
            tenant_id,
        }
    }

    pub fn kind(&self) -> PlcDataKind {
        self.kind
    }

    /// Full rows including labels, input types and text lists.
    pub async fn fetch_catalog(&self) -> Result<Vec<PlcDataRow>, ApiError> {
        self.client.get_json(self.kind.path(), &self.query()).await
    }

    fn query(&self) -> [(&'static str, String); 1] {
        [("tenant_id", self.tenant_id.to_string())]
    }
}

#[async_trait]
impl RowStore for PlcDataStore {
    type Value = SetpointValue;

    async fn fetch_rows(&self) -> Result<Vec<ServerRow<SetpointValue>>, ApiError> {
        Ok(self
            .fetch_catalog()
            .await?
            .into_iter()
            .map(ServerRow::from)
            .collect())
    }

    async fn bulk_update(
        &self,
        rows: &[Row<SetpointValue>],
    ) -> Result<BulkUpdate<SetpointValue>, ApiError> {
        let body: Vec<DataUpdate> = rows
            .iter()
            .map(|row| DataUpdate {
                id: row.id,
                data: row.local_value.to_wire(),
            })
            .collect();
        let response: BulkUpdateResponse<PlcDataRow> = self
            .client
            .put_json(self.kind.path(), &self.query(), &body)
            .await?;
        Ok(into_update(response))
    }
}

impl From<ScheduleRecord> for ServerRow<ScheduleSlot> {
    fn from(record: ScheduleRecord) -> Self {
        ServerRow::new(record.id, record.slot)
    }
}

/// Schedule slots of one plant for one day.
#[derive(Clone)]
pub struct ScheduleStore {
    client: ApiClient,
    plant_id: i64,
    tenant_db: String,
    date: Date,
}

impl ScheduleStore {
    pub fn new(client: ApiClient, plant_id: i64, tenant_db: impl Into<String>, date: Date) -> Self {
        Self {
            client,
            plant_id,
            tenant_db: tenant_db.into(),
            date,
        }
    }

    fn query(&self) -> [(&'static str, String); 3] {
        [
            ("plant_id", self.plant_id.to_string()),
            ("tenant_db", self.tenant_db.clone()),
            ("date", self.date.to_string()),
        ]
    }
}

#[async_trait]
impl RowStore for ScheduleStore {
    type Value = ScheduleSlot;

    async fn fetch_rows(&self) -> Result<Vec<ServerRow<ScheduleSlot>>, ApiError> {
        let records: Vec<ScheduleRecord> = self.client.get_json("/schedule/", &self.query()).await?;
        Ok(records.into_iter().map(ServerRow::from).collect())
    }

    /// `/schedule/bulk` replaces the whole day and deletes every row missing
    /// from the body, so the edits are laid over a fresh read first.
    async fn bulk_update(
        &self,
        rows: &[Row<ScheduleSlot>],
    ) -> Result<BulkUpdate<ScheduleSlot>, ApiError> {
        let current = self.fetch_rows().await?;
        let body = overlay_day(current, rows);
        debug!(
            target = "setpoint::store",
            edited = rows.len(),
            sent = body.len(),
            "schedule day rebuilt for bulk replace"
        );
        let response: BulkUpdateResponse<ScheduleRecord> = self
            .client
            .put_json("/schedule/bulk", &self.query(), &body)
            .await?;
        Ok(into_update(response))
    }
}

/// Current rows with edited ones swapped in, followed by rows the server has
/// not seen yet.
fn overlay_day(
    current: Vec<ServerRow<ScheduleSlot>>,
    edits: &[Row<ScheduleSlot>],
) -> Vec<ScheduleRecord> {
    let mut edited: BTreeMap<i64, &ScheduleSlot> = edits
        .iter()
        .map(|row| (row.id, &row.local_value))
        .collect();
    let mut body: Vec<ScheduleRecord> = current
        .into_iter()
        .map(|row| {
            let slot = match edited.remove(&row.id) {
                Some(slot) => slot.clone(),
                None => row.value,
            };
            schedule_record(row.id, slot)
        })
        .collect();
    // new rows, in buffer order
    body.extend(
        edits
            .iter()
            .filter(|row| edited.contains_key(&row.id))
            .map(|row| schedule_record(row.id, row.local_value.clone())),
    );
    body
}

fn schedule_record(id: i64, slot: ScheduleSlot) -> ScheduleRecord {
    ScheduleRecord {
        id,
        slot,
        updated_at: None,
        updated_by: None,
    }
}
