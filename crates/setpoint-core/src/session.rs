//! Edit session: buffer, validation, submit, acknowledgment, reconcile.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use setpoint_proto::ChannelFrame;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::CommandChannel;
use crate::config::EditorConfig;
use crate::correlator::{CommandCorrelator, CommandOutcome};
use crate::error::{ApiError, ConfigError, SubmitError, ValidationError};
use crate::rows::{Row, RowBuffer, RowValidator};
use crate::store::RowStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditState {
    Idle,
    Sending,
    Success(SuccessKind),
    Failed(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessKind {
    Applied,
    /// Nothing was dirty, so nothing was sent.
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(String),
    Rejected(String),
    TimedOut,
    InFlight,
    Disposed,
}

pub struct EditSession<S: RowStore, R> {
    store: Arc<S>,
    validator: R,
    buffer: RowBuffer<S::Value>,
    correlator: CommandCorrelator,
    channel: Option<CommandChannel>,
    state: Arc<watch::Sender<EditState>>,
    banner_decay: Duration,
    decay_task: Option<JoinHandle<()>>,
}

impl<S, R> EditSession<S, R>
where
    S: RowStore,
    R: RowValidator<S::Value>,
{
    /// Opens the tenant channel from `config` and listens on it for acknowledgments.
    pub async fn connect(
        config: &EditorConfig,
        store: Arc<S>,
        validator: R,
    ) -> Result<Self, ConfigError> {
        let channel = CommandChannel::for_tenant(config, config.tenant()?)?;
        let frames = channel.subscribe();
        channel.open().await;
        let mut session = Self::with_frames(config, store, validator, frames);
        session.channel = Some(channel);
        Ok(session)
    }

    /// Builds a session on an existing frame source.
    pub fn with_frames(
        config: &EditorConfig,
        store: Arc<S>,
        validator: R,
        frames: broadcast::Receiver<ChannelFrame>,
    ) -> Self {
        let (state, _) = watch::channel(EditState::Idle);
        Self {
            store,
            validator,
            buffer: RowBuffer::new(),
            correlator: CommandCorrelator::spawn(frames, config.ack_timeout),
            channel: None,
            state: Arc::new(state),
            banner_decay: config.banner_decay,
            decay_task: None,
        }
    }

    /// Fetches rows from the store and reseeds the buffer. Returns the row count.
    pub async fn load(&mut self) -> Result<usize, ApiError> {
        let rows = self.store.fetch_rows().await?;
        let count = rows.len();
        self.buffer.seed(rows);
        Ok(count)
    }

    pub fn edit(&mut self, id: i64, value: S::Value) -> bool {
        self.buffer.edit(id, value)
    }

    pub fn revert(&mut self, id: i64) -> bool {
        self.buffer.revert(id)
    }

    pub fn revert_all(&mut self) {
        self.buffer.revert_all();
    }

    pub fn insert_local(&mut self, value: S::Value) -> i64 {
        self.buffer.insert_local(value)
    }

    pub fn rows(&self) -> &[Row<S::Value>] {
        self.buffer.rows()
    }

    pub fn buffer(&self) -> &RowBuffer<S::Value> {
        &self.buffer
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn channel(&self) -> Option<&CommandChannel> {
        self.channel.as_ref()
    }

    pub fn invalid_rows(&self) -> BTreeSet<i64> {
        self.validator.invalid_rows(self.buffer.rows())
    }

    pub fn state(&self) -> EditState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EditState> {
        self.state.subscribe()
    }

    /// Sends the dirty rows and waits until the command resolves. Returns the
    /// resulting state; validation failures leave the state untouched.
    pub async fn submit(&mut self) -> Result<EditState, ValidationError> {
        let invalid = self.invalid_rows();
        if !invalid.is_empty() {
            warn!(
                target = "setpoint::session",
                invalid = ?invalid,
                "submit blocked by validation"
            );
            return Err(ValidationError { invalid });
        }

        let payload = self.buffer.dirty_subset();
        if payload.is_empty() {
            return Ok(self.finish(EditState::Success(SuccessKind::NoChanges)));
        }

        self.cancel_decay();
        self.state.send_replace(EditState::Sending);
        let outcome = self.correlator.submit(self.store.as_ref(), &payload).await;

        let next = match outcome {
            Ok(CommandOutcome::Confirmed) => {
                self.reconcile().await;
                EditState::Success(SuccessKind::Applied)
            }
            Ok(CommandOutcome::Rejected(reason)) => EditState::Failed(FailureReason::Rejected(reason)),
            Ok(CommandOutcome::TimedOut) => EditState::Failed(FailureReason::TimedOut),
            Ok(CommandOutcome::Pending) | Err(SubmitError::Disposed) => {
                EditState::Failed(FailureReason::Disposed)
            }
            Err(SubmitError::InFlight) => EditState::Failed(FailureReason::InFlight),
            Err(SubmitError::Transport(err)) => {
                EditState::Failed(FailureReason::Transport(err.to_string()))
            }
        };
        Ok(self.finish(next))
    }

    /// Cancels timers, drops any pending wait and closes the channel.
    pub async fn dispose(mut self) {
        self.cancel_decay();
        self.correlator.shutdown();
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    async fn reconcile(&mut self) {
        match self.store.fetch_rows().await {
            Ok(rows) => self.buffer.seed(rows),
            Err(err) => {
                warn!(
                    target = "setpoint::session",
                    error = %err,
                    "reload after confirmed command failed"
                );
            }
        }
    }

    fn finish(&mut self, next: EditState) -> EditState {
        info!(target = "setpoint::session", state = ?next, "submit finished");
        self.state.send_replace(next.clone());
        self.schedule_decay(next.clone());
        next
    }

    fn schedule_decay(&mut self, shown: EditState) {
        self.cancel_decay();
        let state = Arc::clone(&self.state);
        let decay = self.banner_decay;
        self.decay_task = Some(tokio::spawn(async move {
            tokio::time::sleep(decay).await;
            state.send_if_modified(|current| {
                if *current == shown {
                    *current = EditState::Idle;
                    true
                } else {
                    false
                }
            });
        }));
    }

    fn cancel_decay(&mut self) {
        if let Some(task) = self.decay_task.take() {
            task.abort();
        }
    }
}

impl<S: RowStore, R> Drop for EditSession<S, R> {
    fn drop(&mut self) {
        if let Some(task) = self.decay_task.take() {
            task.abort();
        }
    }
}
