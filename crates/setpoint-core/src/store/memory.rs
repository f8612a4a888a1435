use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use setpoint_proto::{AckStatus, ChannelFrame, CommandAck, ErrorDetail};
use tokio::sync::broadcast;
use tracing::debug;

use super::{BulkUpdate, RowStore};
use crate::error::ApiError;
use crate::rows::{Row, RowValue, ServerRow};

/// Acknowledgment a [`MemoryStore`] publishes for each bulk update.
#[derive(Debug, Clone)]
pub struct Acknowledgement {
    frames: broadcast::Sender<ChannelFrame>,
    token: String,
    status: AckStatus,
    error: Option<ErrorDetail>,
    /// `None` publishes before `bulk_update` returns.
    delay: Option<Duration>,
}

impl Acknowledgement {
    pub fn new(frames: broadcast::Sender<ChannelFrame>, token: impl Into<String>) -> Self {
        Self {
            frames,
            token: token.into(),
            status: AckStatus::Ok,
            error: None,
            delay: Some(Duration::ZERO),
        }
    }

    pub fn with_status(mut self, status: AckStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: ErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn immediately(mut self) -> Self {
        self.delay = None;
        self
    }

    fn frame(&self) -> ChannelFrame {
        ChannelFrame::CommandResponse(CommandAck {
            message_id: self.token.clone(),
            status: self.status,
            error: self.error.clone(),
            command_type: None,
        })
    }
}

/// How a [`MemoryStore`] answers bulk updates.
#[derive(Debug, Clone)]
pub enum Responder {
    /// Apply right away and return the rows.
    Apply,
    /// Return a token and acknowledge it on a frame channel.
    Acknowledge(Acknowledgement),
    /// Return a token that is never acknowledged.
    Silent { token: String },
    Fail(StatusCode),
}

/// In-memory row store for tests and embedding without a backend.
pub struct MemoryStore<V> {
    rows: Mutex<Vec<ServerRow<V>>>,
    submissions: Mutex<Vec<Vec<Row<V>>>>,
    fetches: AtomicUsize,
    responder: Mutex<Responder>,
}

impl<V: RowValue> MemoryStore<V> {
    pub fn new(rows: impl IntoIterator<Item = ServerRow<V>>) -> Self {
        Self::with_responder(rows, Responder::Apply)
    }

    pub fn with_responder(rows: impl IntoIterator<Item = ServerRow<V>>, responder: Responder) -> Self {
        Self {
            rows: Mutex::new(rows.into_iter().collect()),
            submissions: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            responder: Mutex::new(responder),
        }
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = responder;
    }

    pub fn snapshot(&self) -> Vec<ServerRow<V>> {
        self.rows.lock().clone()
    }

    /// Every payload received, in order.
    pub fn submissions(&self) -> Vec<Vec<Row<V>>> {
        self.submissions.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn apply(&self, payload: &[Row<V>]) -> Vec<ServerRow<V>> {
        let mut rows = self.rows.lock();
        let mut applied = Vec::with_capacity(payload.len());
        for row in payload {
            let id = match rows.iter_mut().find(|existing| existing.id == row.id) {
                Some(existing) => {
                    existing.value = row.local_value.clone();
                    existing.id
                }
                None => {
                    let id = rows.iter().map(|existing| existing.id).max().unwrap_or(0) + 1;
                    rows.push(ServerRow::new(id, row.local_value.clone()));
                    id
                }
            };
            applied.push(ServerRow::new(id, row.local_value.clone()));
        }
        applied
    }
}

#[async_trait]
impl<V: RowValue> RowStore for MemoryStore<V> {
    type Value = V;

    async fn fetch_rows(&self) -> Result<Vec<ServerRow<V>>, ApiError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.snapshot())
    }

    async fn bulk_update(&self, rows: &[Row<V>]) -> Result<BulkUpdate<V>, ApiError> {
        self.submissions.lock().push(rows.to_vec());
        let responder = self.responder.lock().clone();
        match responder {
            Responder::Apply => Ok(BulkUpdate::Applied(self.apply(rows))),
            Responder::Acknowledge(ack) => {
                if ack.status.is_success() {
                    self.apply(rows);
                }
                let frame = ack.frame();
                match ack.delay {
                    None => {
                        let _ = ack.frames.send(frame);
                    }
                    Some(delay) => {
                        let frames = ack.frames.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if frames.send(frame).is_err() {
                                debug!(target = "setpoint::store", "acknowledgment had no listener");
                            }
                        });
                    }
                }
                Ok(BulkUpdate::Pending {
                    correlation_token: ack.token,
                })
            }
            Responder::Silent { token } => Ok(BulkUpdate::Pending {
                correlation_token: token,
            }),
            Responder::Fail(status) => Err(ApiError::UnexpectedStatus {
                status,
                body: "simulated failure".into(),
            }),
        }
    }
}
