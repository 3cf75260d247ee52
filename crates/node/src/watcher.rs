//! Polls the chain for registry events, keeps the node list fresh and persists progress.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use in3_node_storage::{CheckpointError, CheckpointStore};
use in3_node_types::{B256, BlockNumber, WatcherCheckpoint};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::context::{ChainContext, ContextError};
use crate::nodelist::{SyncError, sync_node_list};
use crate::registry::{RegistryEvent, decode_registry_log, registry_event_topics};
use crate::upstream::{ChainSource, LogFilter, UpstreamError};
use crate::validators::update_validator_history;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("node list sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("head block {0} is not available upstream")]
    MissingBlock(BlockNumber),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Delivered to subscribers after each checkpoint commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherNotification {
    pub chain_id: String,
    pub block: BlockNumber,
    pub block_hash: B256,
    pub events: Vec<RegistryEvent>,
    pub node_list_resynced: bool,
}

pub trait NotificationSink: Send {
    fn on_notification(&mut self, notification: &WatcherNotification) -> Result<(), String>;
}

/// Forwards notifications into an unbounded channel.
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<WatcherNotification>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<WatcherNotification>) -> Self {
        Self { sender }
    }
}

impl NotificationSink for ChannelSink {
    fn on_notification(&mut self, notification: &WatcherNotification) -> Result<(), String> {
        self.sender
            .send(notification.clone())
            .map_err(|_| "notification receiver dropped".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Subscriptions {
    sinks: Mutex<BTreeMap<SubscriptionId, Box<dyn NotificationSink>>>,
    next_id: AtomicU64,
}

impl Subscriptions {
    pub fn register(&self, sink: Box<dyn NotificationSink>) -> Result<SubscriptionId, WatcherError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .lock()
            .map_err(|_| WatcherError::Poisoned("subscriptions"))?
            .insert(id, sink);
        Ok(id)
    }

    /// Returns whether `id` was registered.
    pub fn unregister(&self, id: SubscriptionId) -> Result<bool, WatcherError> {
        Ok(self
            .sinks
            .lock()
            .map_err(|_| WatcherError::Poisoned("subscriptions"))?
            .remove(&id)
            .is_some())
    }

    pub fn len(&self) -> Result<usize, WatcherError> {
        Ok(self
            .sinks
            .lock()
            .map_err(|_| WatcherError::Poisoned("subscriptions"))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, WatcherError> {
        Ok(self.len()? == 0)
    }

    /// Delivers to every sink in registration order; a failing sink does not stop the others.
    pub fn dispatch(&self, notification: &WatcherNotification) -> Result<usize, WatcherError> {
        let mut sinks = self
            .sinks
            .lock()
            .map_err(|_| WatcherError::Poisoned("subscriptions"))?;
        let mut delivered = 0;
        for (id, sink) in sinks.iter_mut() {
            match sink.on_notification(notification) {
                Ok(()) => delivered += 1,
                Err(error) => warn!(subscription = id.0, %error, "notification sink failed"),
            }
        }
        Ok(delivered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Head has not moved past the checkpoint.
    Idle { head: BlockNumber },
    Advanced {
        checkpoint: WatcherCheckpoint,
        events: usize,
        node_list_resynced: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStatus {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub last_checkpoint: Option<BlockNumber>,
    pub last_error: Option<String>,
    pub outage: bool,
}

/// Shared view of a watcher's tick results.
#[derive(Debug, Clone)]
pub struct WatcherHealth {
    status: Arc<Mutex<WatcherStatus>>,
    max_consecutive_failures: u64,
}

impl WatcherHealth {
    pub fn new(max_consecutive_failures: u64) -> Self {
        Self {
            status: Arc::new(Mutex::new(WatcherStatus::default())),
            max_consecutive_failures,
        }
    }

    pub fn status(&self) -> Result<WatcherStatus, String> {
        self.status
            .lock()
            .map(|status| status.clone())
            .map_err(|_| "watcher status lock poisoned".to_string())
    }

    pub fn record_success(&self, checkpoint: Option<BlockNumber>) -> Result<(), String> {
        self.update(|status| {
            status.success_count = status.success_count.saturating_add(1);
            status.consecutive_failures = 0;
            status.last_error = None;
            status.outage = false;
            if checkpoint.is_some() {
                status.last_checkpoint = checkpoint;
            }
        })
    }

    pub fn record_failure(&self, message: String) -> Result<(), String> {
        let max = self.max_consecutive_failures;
        self.update(|status| {
            status.failure_count = status.failure_count.saturating_add(1);
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.last_error = Some(message);
            status.outage = status.consecutive_failures > max;
        })
    }

    fn update(&self, update: impl FnOnce(&mut WatcherStatus)) -> Result<(), String> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| "watcher status lock poisoned".to_string())?;
        update(&mut status);
        Ok(())
    }
}

pub struct EventWatcher {
    source: Arc<dyn ChainSource>,
    context: Arc<ChainContext>,
    checkpoints: Arc<dyn CheckpointStore>,
    subscriptions: Subscriptions,
    health: WatcherHealth,
    interval: Duration,
}

impl EventWatcher {
    pub fn new(
        source: Arc<dyn ChainSource>,
        context: Arc<ChainContext>,
        checkpoints: Arc<dyn CheckpointStore>,
        interval: Duration,
        max_consecutive_failures: u64,
    ) -> Self {
        Self {
            source,
            context,
            checkpoints,
            subscriptions: Subscriptions::default(),
            health: WatcherHealth::new(max_consecutive_failures),
            interval,
        }
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn health(&self) -> WatcherHealth {
        self.health.clone()
    }

    /// One polling step. Errors leave the checkpoint where it was.
    pub async fn tick(&self) -> Result<TickOutcome, WatcherError> {
        let chain = self.context.chain_id();
        let checkpoint = self.checkpoints.load()?;
        let head = self.source.block_number().await?;
        if head <= checkpoint.number {
            return Ok(TickOutcome::Idle { head });
        }
        let header = self
            .source
            .block_by_number(head)
            .await?
            .ok_or(WatcherError::MissingBlock(head))?;

        let range = head - checkpoint.number;
        let (events, node_list_resynced) = if range > self.context.settings().max_log_range {
            info!(
                chain,
                from = checkpoint.number + 1,
                to = head,
                "block range too large for a log query, resyncing node list"
            );
            sync_node_list(self.source.as_ref(), &self.context).await?;
            (Vec::new(), true)
        } else {
            self.registry_events(checkpoint.number + 1, head).await?
        };

        let next = WatcherCheckpoint {
            number: head,
            hash: header.hash,
        };
        if !self.checkpoints.save(next)? {
            debug!(chain, block = head, "checkpoint did not advance");
        }

        let notification = WatcherNotification {
            chain_id: chain.to_string(),
            block: head,
            block_hash: header.hash,
            events,
            node_list_resynced,
        };
        self.subscriptions.dispatch(&notification)?;

        if let Err(error) = update_validator_history(self.source.as_ref(), &self.context).await {
            warn!(chain, %error, "validator history update failed");
        }

        Ok(TickOutcome::Advanced {
            checkpoint: next,
            events: notification.events.len(),
            node_list_resynced,
        })
    }

    async fn registry_events(
        &self,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<(Vec<RegistryEvent>, bool), WatcherError> {
        let snapshot = self.context.snapshot()?;
        let mut addresses = vec![self.context.registry()];
        if snapshot.contract != self.context.registry() {
            addresses.push(snapshot.contract);
        }
        let logs = self
            .source
            .logs(LogFilter {
                from_block: from,
                to_block: to,
                addresses,
                topic0: registry_event_topics(),
            })
            .await?;
        if logs.is_empty() {
            return Ok((Vec::new(), false));
        }

        sync_node_list(self.source.as_ref(), &self.context).await?;
        let events = logs
            .iter()
            .filter_map(|log| match decode_registry_log(log) {
                Ok(event) => event,
                Err(error) => {
                    warn!(block = ?log.block(), %error, "undecodable registry log");
                    None
                }
            })
            .collect::<Vec<_>>();
        for event in &events {
            info!(chain = self.context.chain_id(), event = event.name(), "registry event");
        }
        Ok((events, true))
    }

    /// Ticks until `shutdown` flips to true, sleeping `interval` after each tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let chain = self.context.chain_id();
        loop {
            let recorded = match self.tick().await {
                Ok(TickOutcome::Idle { .. }) => self.health.record_success(None),
                Ok(TickOutcome::Advanced { checkpoint, .. }) => {
                    self.health.record_success(Some(checkpoint.number))
                }
                Err(error) => {
                    warn!(chain, %error, "watcher tick failed");
                    self.health.record_failure(error.to_string())
                }
            };
            if let Err(error) = recorded {
                warn!(chain, %error, "failed to record watcher health");
            }

            tokio::select! {
                _ = sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(chain, "watcher stopped");
                        return;
                    }
                }
            }
        }
    }
}
