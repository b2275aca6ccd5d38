//! The reliable status-update pipeline.
//!
//! One stream per `(framework, task)`. Accepted updates are durably
//! recorded (for checkpointing frameworks), then forwarded to the current
//! master front-of-queue only: the next update in a stream is not sent
//! until the master acknowledges the one before it, which preserves
//! ordering, and the front is re-sent on a timer until acknowledged, which
//! gives at-least-once delivery.
//!
//! Runs as its own actor task; the agent talks to it through
//! [`StatusUpdateManager`] and awaits the replies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use skiff_id::{FrameworkId, TaskId, UpdateId};
use skiff_messages::{AgentOutbound, Endpoint, StatusUpdate};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointError, UpdateRecord};
use crate::outbox::Outbox;

#[derive(Debug, Error)]
pub enum UpdateManagerError {
    #[error("update manager stopped")]
    Stopped,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("no update stream for task {task_id} of framework {framework_id}")]
    UnknownStream {
        framework_id: FrameworkId,
        task_id: TaskId,
    },

    #[error("unexpected acknowledgement {update_id} for task {task_id}")]
    UnexpectedAck { task_id: TaskId, update_id: UpdateId },
}

/// A stream rebuilt from a task's checkpointed update log.
#[derive(Debug)]
pub struct RecoveredStream {
    pub framework_id: FrameworkId,
    pub task_id: TaskId,
    pub path: Option<PathBuf>,
    /// Updates in checkpoint order.
    pub updates: Vec<StatusUpdate>,
    pub acks: HashSet<UpdateId>,
}

enum Msg {
    Update {
        update: StatusUpdate,
        checkpoint: bool,
        path: Option<PathBuf>,
        reply: oneshot::Sender<Result<(), UpdateManagerError>>,
    },
    Acknowledgement {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        reply: oneshot::Sender<Result<(), UpdateManagerError>>,
    },
    NewMaster {
        master: Endpoint,
    },
    Cleanup {
        framework_id: FrameworkId,
    },
    Recover {
        streams: Vec<RecoveredStream>,
        reply: oneshot::Sender<()>,
    },
    RetryTick {
        framework_id: FrameworkId,
        task_id: TaskId,
        epoch: u64,
    },
}

/// Handle to the update-manager actor.
#[derive(Clone)]
pub struct StatusUpdateManager {
    tx: mpsc::Sender<Msg>,
}

impl StatusUpdateManager {
    /// Spawns the actor.
    pub fn spawn(outbox: Arc<dyn Outbox>, retry_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            streams: HashMap::new(),
            master: None,
            outbox,
            retry_interval,
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Durably enqueues an update. Resolves once it is safe to acknowledge
    /// the source executor.
    pub async fn update(
        &self,
        update: StatusUpdate,
        checkpoint: bool,
        path: Option<PathBuf>,
    ) -> Result<(), UpdateManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Update {
                update,
                checkpoint,
                path,
                reply,
            })
            .await
            .map_err(|_| UpdateManagerError::Stopped)?;
        rx.await.map_err(|_| UpdateManagerError::Stopped)?
    }

    /// Durably records a master acknowledgement and advances the stream.
    pub async fn acknowledgement(
        &self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    ) -> Result<(), UpdateManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Acknowledgement {
                framework_id,
                task_id,
                update_id,
                reply,
            })
            .await
            .map_err(|_| UpdateManagerError::Stopped)?;
        rx.await.map_err(|_| UpdateManagerError::Stopped)?
    }

    /// Retargets retries at a new master and re-sends stream fronts.
    pub async fn new_master(&self, master: Endpoint) {
        let _ = self.tx.send(Msg::NewMaster { master }).await;
    }

    /// Drops every stream belonging to a framework.
    pub async fn cleanup(&self, framework_id: FrameworkId) {
        let _ = self.tx.send(Msg::Cleanup { framework_id }).await;
    }

    /// Rebuilds streams from checkpointed state.
    pub async fn recover(&self, streams: Vec<RecoveredStream>) -> Result<(), UpdateManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Recover { streams, reply })
            .await
            .map_err(|_| UpdateManagerError::Stopped)?;
        rx.await.map_err(|_| UpdateManagerError::Stopped)
    }
}

struct UpdateStream {
    checkpoint: bool,
    path: Option<PathBuf>,
    /// Every update ID ever accepted, for duplicate suppression.
    received: HashSet<UpdateId>,
    /// Unacknowledged updates in acceptance order; the front is in flight.
    pending: VecDeque<StatusUpdate>,
    /// Bumped on every (re)send so stale retry timers are recognizable.
    epoch: u64,
}

struct Actor {
    streams: HashMap<(FrameworkId, TaskId), UpdateStream>,
    master: Option<Endpoint>,
    outbox: Arc<dyn Outbox>,
    retry_interval: Duration,
    tx: mpsc::Sender<Msg>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Update {
                    update,
                    checkpoint,
                    path,
                    reply,
                } => {
                    let result = self.handle_update(update, checkpoint, path).await;
                    let _ = reply.send(result);
                }
                Msg::Acknowledgement {
                    framework_id,
                    task_id,
                    update_id,
                    reply,
                } => {
                    let result = self.handle_ack(framework_id, task_id, update_id).await;
                    let _ = reply.send(result);
                }
                Msg::NewMaster { master } => self.handle_new_master(master).await,
                Msg::Cleanup { framework_id } => {
                    let before = self.streams.len();
                    self.streams.retain(|(fid, _), _| *fid != framework_id);
                    info!(
                        framework_id = %framework_id,
                        dropped = before - self.streams.len(),
                        "Cleaned up update streams"
                    );
                }
                Msg::Recover { streams, reply } => {
                    self.handle_recover(streams).await;
                    let _ = reply.send(());
                }
                Msg::RetryTick {
                    framework_id,
                    task_id,
                    epoch,
                } => {
                    self.handle_retry(framework_id, task_id, epoch).await;
                }
            }
        }
    }

    async fn handle_update(
        &mut self,
        update: StatusUpdate,
        checkpoint: bool,
        path: Option<PathBuf>,
    ) -> Result<(), UpdateManagerError> {
        let key = (update.framework_id.clone(), update.task_id.clone());

        let stream = self.streams.entry(key.clone()).or_insert_with(|| UpdateStream {
            checkpoint,
            path,
            received: HashSet::new(),
            pending: VecDeque::new(),
            epoch: 0,
        });

        if stream.received.contains(&update.update_id) {
            // At-least-once senders re-deliver; the record already exists.
            debug!(update = %update, "Ignoring duplicate status update");
            return Ok(());
        }

        if stream.checkpoint {
            if let Some(path) = &stream.path {
                checkpoint::append_record(
                    path,
                    &UpdateRecord::Update {
                        update: update.clone(),
                    },
                )?;
            }
        }

        stream.received.insert(update.update_id);
        stream.pending.push_back(update);

        if stream.pending.len() == 1 {
            self.forward(&key).await;
        }

        Ok(())
    }

    async fn handle_ack(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    ) -> Result<(), UpdateManagerError> {
        let key = (framework_id.clone(), task_id.clone());
        let Some(stream) = self.streams.get_mut(&key) else {
            return Err(UpdateManagerError::UnknownStream {
                framework_id,
                task_id,
            });
        };

        let Some(front) = stream.pending.front() else {
            return Err(UpdateManagerError::UnexpectedAck { task_id, update_id });
        };

        if front.update_id != update_id {
            warn!(
                expected = %front.update_id,
                got = %update_id,
                task_id = %task_id,
                "Out-of-order acknowledgement"
            );
            return Err(UpdateManagerError::UnexpectedAck { task_id, update_id });
        }

        if stream.checkpoint {
            if let Some(path) = &stream.path {
                checkpoint::append_record(path, &UpdateRecord::Ack { update_id })?;
            }
        }

        let acked = stream.pending.pop_front().expect("front exists");
        stream.epoch += 1; // Invalidate the in-flight retry timer.

        if acked.state.is_terminal() {
            debug!(task_id = %task_id, "Terminal update acknowledged, closing stream");
            self.streams.remove(&key);
        } else if !stream.pending.is_empty() {
            self.forward(&key).await;
        }

        Ok(())
    }

    async fn handle_new_master(&mut self, master: Endpoint) {
        info!(master = %master, "Retargeting status-update retries");
        self.master = Some(master);

        let keys: Vec<_> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.forward(&key).await;
        }
    }

    async fn handle_recover(&mut self, streams: Vec<RecoveredStream>) {
        for rec in streams {
            let mut stream = UpdateStream {
                checkpoint: rec.path.is_some(),
                path: rec.path,
                received: HashSet::new(),
                pending: VecDeque::new(),
                epoch: 0,
            };

            for update in rec.updates {
                stream.received.insert(update.update_id);
                if !rec.acks.contains(&update.update_id) {
                    stream.pending.push_back(update);
                }
            }

            info!(
                framework_id = %rec.framework_id,
                task_id = %rec.task_id,
                pending = stream.pending.len(),
                "Recovered update stream"
            );

            let key = (rec.framework_id, rec.task_id);
            if stream.pending.is_empty() && stream.received.is_empty() {
                continue;
            }
            self.streams.insert(key.clone(), stream);

            if self.master.is_some() && !self.streams[&key].pending.is_empty() {
                self.forward(&key).await;
            }
        }
    }

    async fn handle_retry(&mut self, framework_id: FrameworkId, task_id: TaskId, epoch: u64) {
        let key = (framework_id, task_id);
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        if stream.epoch != epoch || stream.pending.is_empty() {
            return; // Stale timer.
        }

        if let Some(front) = stream.pending.front() {
            warn!(update = %front, "Retrying unacknowledged status update");
        }
        self.forward(&key).await;
    }

    /// Sends the stream's front update to the current master and arms the
    /// retry timer for it.
    async fn forward(&mut self, key: &(FrameworkId, TaskId)) {
        let Some(master) = self.master.clone() else {
            debug!("No master known, holding status updates");
            return;
        };

        let Some(stream) = self.streams.get_mut(key) else {
            return;
        };
        let Some(front) = stream.pending.front().cloned() else {
            return;
        };

        stream.epoch += 1;
        let epoch = stream.epoch;

        debug!(update = %front, master = %master, "Forwarding status update");
        self.outbox
            .send(&master, AgentOutbound::StatusUpdate { update: front })
            .await;

        let tx = self.tx.clone();
        let retry_interval = self.retry_interval;
        let (framework_id, task_id) = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retry_interval).await;
            let _ = tx
                .send(Msg::RetryTick {
                    framework_id,
                    task_id,
                    epoch,
                })
                .await;
        });
    }
}
