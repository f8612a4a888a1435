//! Where rows come from and where edits go.

mod http;
mod memory;

use async_trait::async_trait;

pub use http::{ApiClient, PlcDataKind, PlcDataStore, ScheduleStore};
pub use memory::{Acknowledgement, MemoryStore, Responder};

use crate::error::ApiError;
use crate::rows::{Row, RowValue, ServerRow};

/// Result of a bulk update request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkUpdate<V> {
    /// Handed to the controller; the outcome arrives later on the command channel.
    Pending { correlation_token: String },
    /// The backend applied the rows itself and returned them.
    Applied(Vec<ServerRow<V>>),
}

#[async_trait]
pub trait RowStore: Send + Sync {
    type Value: RowValue;

    async fn fetch_rows(&self) -> Result<Vec<ServerRow<Self::Value>>, ApiError>;

    /// Sends the given rows as one command.
    async fn bulk_update(
        &self,
        rows: &[Row<Self::Value>],
    ) -> Result<BulkUpdate<Self::Value>, ApiError>;
}
