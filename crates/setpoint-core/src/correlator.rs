//! Matches bulk-update correlation tokens with acknowledgments arriving on
//! the command channel.
//!
//! The correlator is an actor: a single task owns the awaited token, its
//! deadline and the resolver, and everything else talks to it through a
//! request queue.

use std::collections::VecDeque;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use setpoint_proto::{AckStatus, ChannelFrame, CommandAck};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::error::SubmitError;
use crate::rows::Row;
use crate::store::{BulkUpdate, RowStore};

/// Acknowledgments held while the bulk-update request is still in flight.
const EARLY_ACK_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Pending,
    Confirmed,
    Rejected(String),
    TimedOut,
}

impl CommandOutcome {
    fn from_ack(ack: &CommandAck) -> Self {
        match ack.status {
            AckStatus::Ok | AckStatus::Success => CommandOutcome::Confirmed,
            AckStatus::Error => CommandOutcome::Rejected(ack.reason()),
            AckStatus::Timeout => CommandOutcome::TimedOut,
        }
    }
}

enum Request {
    Reserve {
        reply: oneshot::Sender<Option<u64>>,
    },
    Await {
        reservation: u64,
        token: String,
        resolver: oneshot::Sender<CommandOutcome>,
    },
    Release {
        reservation: u64,
    },
    Inspect {
        reply: oneshot::Sender<SlotView>,
    },
    Shutdown,
}

#[derive(Default)]
struct SlotView {
    busy: bool,
    token: Option<String>,
}

enum Slot {
    Idle,
    Requesting {
        reservation: u64,
        early: VecDeque<CommandAck>,
    },
    Awaiting {
        reservation: u64,
        token: String,
        resolver: oneshot::Sender<CommandOutcome>,
        deadline: Pin<Box<Sleep>>,
    },
}

pub struct CommandCorrelator {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

impl CommandCorrelator {
    /// Spawns the actor. Acknowledgments are read from `frames`; a token left
    /// unanswered for `ack_timeout` resolves as [`CommandOutcome::TimedOut`].
    pub fn spawn(frames: broadcast::Receiver<ChannelFrame>, ack_timeout: Duration) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, frames, ack_timeout));
        Self { requests, task }
    }

    /// Sends `payload` through `store` and waits for the command to resolve.
    pub async fn submit<S>(
        &self,
        store: &S,
        payload: &[Row<S::Value>],
    ) -> Result<CommandOutcome, SubmitError>
    where
        S: RowStore + ?Sized,
    {
        let reservation = self.reserve().await?;

        info!(
            target = "setpoint::correlator",
            rows = payload.len(),
            "submitting bulk update"
        );
        let token = match store.bulk_update(payload).await? {
            BulkUpdate::Applied(rows) => {
                info!(
                    target = "setpoint::correlator",
                    rows = rows.len(),
                    "bulk update applied without acknowledgment"
                );
                return Ok(CommandOutcome::Confirmed);
            }
            BulkUpdate::Pending { correlation_token } => correlation_token,
        };

        debug!(target = "setpoint::correlator", token = %token, "awaiting acknowledgment");
        let (resolver, outcome) = oneshot::channel();
        self.requests
            .send(Request::Await {
                reservation: reservation.id,
                token,
                resolver,
            })
            .map_err(|_| SubmitError::Disposed)?;
        outcome.await.map_err(|_| SubmitError::Disposed)
    }

    /// Token currently awaiting its acknowledgment, if any.
    pub async fn awaited_token(&self) -> Option<String> {
        self.inspect().await.token
    }

    /// `Some(Pending)` while a submit is outstanding, `None` when idle.
    pub async fn status(&self) -> Option<CommandOutcome> {
        self.inspect().await.busy.then_some(CommandOutcome::Pending)
    }

    async fn inspect(&self) -> SlotView {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Inspect { reply }).is_err() {
            return SlotView::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Drops any outstanding wait; its submit resolves with [`SubmitError::Disposed`].
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    async fn reserve(&self) -> Result<Reservation, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Reserve { reply })
            .map_err(|_| SubmitError::Disposed)?;
        match rx.await {
            Ok(Some(id)) => Ok(Reservation {
                id,
                requests: self.requests.clone(),
            }),
            Ok(None) => Err(SubmitError::InFlight),
            Err(_) => Err(SubmitError::Disposed),
        }
    }
}

impl Drop for CommandCorrelator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Frees the slot when a submit finishes or is cancelled.
struct Reservation {
    id: u64,
    requests: mpsc::UnboundedSender<Request>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Release {
            reservation: self.id,
        });
    }
}

async fn run(
    mut requests: mpsc::UnboundedReceiver<Request>,
    frames: broadcast::Receiver<ChannelFrame>,
    ack_timeout: Duration,
) {
    let mut frames = Some(frames);
    let mut slot = Slot::Idle;
    let mut next_reservation: u64 = 0;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                match request {
                    Request::Reserve { reply } => {
                        let granted = if matches!(slot, Slot::Idle) {
                            next_reservation += 1;
                            slot = Slot::Requesting {
                                reservation: next_reservation,
                                early: VecDeque::new(),
                            };
                            Some(next_reservation)
                        } else {
                            None
                        };
                        let _ = reply.send(granted);
                    }
                    Request::Await { reservation, token, resolver } => {
                        slot = begin_wait(slot, reservation, token, resolver, ack_timeout);
                    }
                    Request::Release { reservation } => {
                        if slot_reservation(&slot) == Some(reservation) {
                            slot = Slot::Idle;
                        }
                    }
                    Request::Inspect { reply } => {
                        let view = match &slot {
                            Slot::Idle => SlotView::default(),
                            Slot::Requesting { .. } => SlotView { busy: true, token: None },
                            Slot::Awaiting { token, .. } => SlotView {
                                busy: true,
                                token: Some(token.clone()),
                            },
                        };
                        let _ = reply.send(view);
                    }
                    Request::Shutdown => break,
                }
            }
            frame = next_frame(&mut frames) => match frame {
                Some(ChannelFrame::CommandResponse(ack)) => {
                    slot = on_ack(slot, ack);
                }
                Some(_) => {}
                None => {
                    debug!(target = "setpoint::correlator", "frame source closed");
                    frames = None;
                }
            },
            _ = wait_deadline(&mut slot) => {
                if let Slot::Awaiting { token, resolver, .. } = std::mem::replace(&mut slot, Slot::Idle) {
                    warn!(target = "setpoint::correlator", token = %token, "acknowledgment timed out");
                    let _ = resolver.send(CommandOutcome::TimedOut);
                }
            }
        }
    }
    debug!(target = "setpoint::correlator", "correlator stopped");
}

fn slot_reservation(slot: &Slot) -> Option<u64> {
    match slot {
        Slot::Idle => None,
        Slot::Requesting { reservation, .. } | Slot::Awaiting { reservation, .. } => {
            Some(*reservation)
        }
    }
}

fn begin_wait(
    slot: Slot,
    reservation: u64,
    token: String,
    resolver: oneshot::Sender<CommandOutcome>,
    ack_timeout: Duration,
) -> Slot {
    let (current, early) = match slot {
        Slot::Requesting { reservation, early } => (reservation, early),
        // released in the meantime; dropping the resolver reports disposal
        other => return other,
    };
    if current != reservation {
        return Slot::Requesting {
            reservation: current,
            early,
        };
    }

    for ack in early {
        if ack.message_id == token {
            info!(
                target = "setpoint::correlator",
                token = %token,
                status = ?ack.status,
                "acknowledgment arrived before the bulk update returned"
            );
            let _ = resolver.send(CommandOutcome::from_ack(&ack));
            return Slot::Idle;
        }
        debug!(
            target = "setpoint::correlator",
            token = %ack.message_id,
            "discarding stale acknowledgment"
        );
    }

    Slot::Awaiting {
        reservation,
        token,
        resolver,
        deadline: Box::pin(tokio::time::sleep(ack_timeout)),
    }
}

fn on_ack(slot: Slot, ack: CommandAck) -> Slot {
    match slot {
        Slot::Awaiting {
            reservation,
            token,
            resolver,
            deadline,
        } => {
            if ack.message_id != token {
                debug!(
                    target = "setpoint::correlator",
                    expected = %token,
                    received = %ack.message_id,
                    "ignoring acknowledgment for another command"
                );
                return Slot::Awaiting {
                    reservation,
                    token,
                    resolver,
                    deadline,
                };
            }
            let outcome = CommandOutcome::from_ack(&ack);
            info!(
                target = "setpoint::correlator",
                token = %token,
                outcome = ?outcome,
                "command resolved"
            );
            let _ = resolver.send(outcome);
            Slot::Idle
        }
        Slot::Requesting {
            reservation,
            mut early,
        } => {
            if early.len() == EARLY_ACK_CAPACITY {
                early.pop_front();
            }
            early.push_back(ack);
            Slot::Requesting { reservation, early }
        }
        Slot::Idle => {
            debug!(
                target = "setpoint::correlator",
                token = %ack.message_id,
                "no command in flight, ignoring acknowledgment"
            );
            Slot::Idle
        }
    }
}

async fn next_frame(
    frames: &mut Option<broadcast::Receiver<ChannelFrame>>,
) -> Option<ChannelFrame> {
    let Some(rx) = frames.as_mut() else {
        return pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target = "setpoint::correlator", skipped, "frame subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn wait_deadline(slot: &mut Slot) {
    match slot {
        Slot::Awaiting { deadline, .. } => deadline.as_mut().await,
        _ => pending().await,
    }
}
