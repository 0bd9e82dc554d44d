//! Batch transfer coordinator.
//!
//! A batch is bracketed on the command channel by `BatchAnnounce` and
//! `BatchComplete`, with a `BatchItemStarting` before each item's resource
//! stream. [`TransferCoordinator::start_transfer`] returns as soon as the
//! first item has begun; a background task streams the rest in index order
//! and publishes [`BatchProgress`] on a watch channel.
//!
//! Every item ends in exactly one [`ItemOutcome`]. Its wait races normal
//! completion, cancellation from the transport, and a hard timeout, and the
//! first to fire wins. Temporary sources are deleted once per batch after a
//! grace delay, whatever happened.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::TransferPolicy;
use crate::error::NetworkError;
use crate::link::{ResourceHandle, ResourceStatus};

/// One file to send.
#[derive(Debug, Clone)]
pub struct TransferSource {
    /// Name announced to the receiver.
    pub name: String,
    pub path: PathBuf,
    /// Delete `path` after the batch.
    pub temporary: bool,
}

impl TransferSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            temporary: false,
        }
    }

    pub fn temporary(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            temporary: true,
            ..Self::new(name, path)
        }
    }
}

/// Terminal outcome of a batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    InFlight,
    Done(ItemOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemSnapshot {
    pub name: String,
    pub progress: f64,
    pub state: ItemState,
}

/// Progress of a running batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    /// 1-based index of the item being sent.
    pub current_index: usize,
    pub total: usize,
    /// Progress of the current item in `[0, 1]`.
    pub current_progress: f64,
    pub items: Vec<ItemSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    Success,
    PartialSuccess,
    Failed,
}

/// Final aggregate of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub success_count: usize,
    pub total: usize,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn from_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        Self {
            success_count: outcomes
                .iter()
                .filter(|o| **o == ItemOutcome::Succeeded)
                .count(),
            total: outcomes.len(),
            outcomes,
        }
    }

    pub fn result(&self) -> BatchResult {
        match self.success_count {
            0 => BatchResult::Failed,
            n if n == self.total => BatchResult::Success,
            _ => BatchResult::PartialSuccess,
        }
    }

    /// At least one item arrived.
    pub fn is_success(&self) -> bool {
        self.success_count > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no items to transfer")]
    NoItems,

    #[error("no connected peer")]
    NoPeer,

    #[error("a batch is already in flight")]
    BatchInFlight,

    #[error("first item could not start: {0}")]
    StartFailed(#[source] NetworkError),
}

/// The channels a batch is sent over.
#[async_trait]
pub trait TransferLink: Send + Sync {
    async fn send_command(&self, command: Command) -> Result<(), NetworkError>;

    async fn send_resource(&self, name: &str, path: &Path)
    -> Result<ResourceHandle, NetworkError>;
}

/// Deletes temporary sources.
#[async_trait]
pub trait ResourceCleaner: Send + Sync {
    async fn cleanup(&self, paths: Vec<PathBuf>);
}

/// Removes files from disk.
pub struct FileCleaner;

#[async_trait]
impl ResourceCleaner for FileCleaner {
    async fn cleanup(&self, paths: Vec<PathBuf>) {
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed temporary {}", path.display()),
                Err(e) => debug!("Cannot remove {}: {e}", path.display()),
            }
        }
    }
}

/// A running batch.
pub struct BatchHandle {
    total: usize,
    progress: watch::Receiver<BatchProgress>,
    task: JoinHandle<BatchReport>,
}

impl BatchHandle {
    pub fn total(&self) -> usize {
        self.total
    }

    /// A receiver for progress updates.
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress.clone()
    }

    pub fn current(&self) -> BatchProgress {
        self.progress.borrow().clone()
    }

    /// Wait for every item to reach a terminal outcome.
    pub async fn finished(self) -> BatchReport {
        let total = self.total;
        self.task.await.unwrap_or_else(|e| {
            warn!("Batch task ended abnormally: {e}");
            BatchReport::from_outcomes(vec![ItemOutcome::Cancelled; total])
        })
    }
}

pub struct TransferCoordinator {
    link: Arc<dyn TransferLink>,
    cleaner: Arc<dyn ResourceCleaner>,
    policy: TransferPolicy,
    busy: Arc<AtomicBool>,
}

impl TransferCoordinator {
    pub fn new(link: Arc<dyn TransferLink>, policy: TransferPolicy) -> Self {
        Self {
            link,
            cleaner: Arc::new(FileCleaner),
            policy,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn ResourceCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Whether a batch is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Send `items` to the connected peer.
    ///
    /// Returns once the first item's stream has begun. Fails without side
    /// effects on an empty batch, a missing peer or a batch in flight.
    pub async fn start_transfer(
        &self,
        items: Vec<TransferSource>,
        peer_available: bool,
    ) -> Result<BatchHandle, TransferError> {
        if items.is_empty() {
            return Err(TransferError::NoItems);
        }
        if !peer_available {
            return Err(TransferError::NoPeer);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::BatchInFlight);
        }
        let busy = BusyGuard(Arc::clone(&self.busy));

        let total = items.len();
        let cleanup = Cleanup {
            paths: items
                .iter()
                .filter(|i| i.temporary)
                .map(|i| i.path.clone())
                .collect(),
            cleaner: Arc::clone(&self.cleaner),
            grace: self.policy.cleanup_grace,
        };

        info!("Starting batch of {total} item(s)");
        self.emit(Command::BatchAnnounce {
            file_names: items.iter().map(|i| i.name.clone()).collect(),
        })
        .await;

        let first = &items[0];
        self.emit(Command::BatchItemStarting {
            file_name: first.name.clone(),
            index: 1,
            total: total as u32,
        })
        .await;

        let first_handle = match self.link.send_resource(&first.name, &first.path).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("First item '{}' could not start: {e}", first.name);
                self.emit(Command::BatchComplete).await;
                cleanup.schedule();
                return Err(TransferError::StartFailed(e));
            }
        };

        let mut snapshots: Vec<ItemSnapshot> = items
            .iter()
            .map(|i| ItemSnapshot {
                name: i.name.clone(),
                progress: 0.0,
                state: ItemState::Pending,
            })
            .collect();
        snapshots[0].state = ItemState::InFlight;
        let (progress_tx, progress_rx) = watch::channel(BatchProgress {
            current_index: 1,
            total,
            current_progress: 0.0,
            items: snapshots,
        });

        let batch = BatchRun {
            link: Arc::clone(&self.link),
            items,
            item_timeout: self.policy.item_timeout,
            progress: progress_tx,
        };
        let task = tokio::spawn(async move {
            let report = batch.run(first_handle).await;
            cleanup.schedule();
            drop(busy);
            report
        });

        Ok(BatchHandle {
            total,
            progress: progress_rx,
            task,
        })
    }

    async fn emit(&self, command: Command) {
        send_logged(self.link.as_ref(), command).await;
    }
}

async fn send_logged(link: &dyn TransferLink, command: Command) {
    let kind = command.kind();
    if let Err(e) = link.send_command(command).await {
        warn!("Failed to send {kind}: {e}");
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Deletion of a batch's temporary sources. Consumed when scheduled.
struct Cleanup {
    paths: Vec<PathBuf>,
    cleaner: Arc<dyn ResourceCleaner>,
    grace: Duration,
}

impl Cleanup {
    fn schedule(self) {
        if self.paths.is_empty() {
            return;
        }
        debug!(
            "Removing {} temporary source(s) in {:?}",
            self.paths.len(),
            self.grace
        );
        tokio::spawn(async move {
            tokio::time::sleep(self.grace).await;
            self.cleaner.cleanup(self.paths).await;
        });
    }
}

struct BatchRun {
    link: Arc<dyn TransferLink>,
    items: Vec<TransferSource>,
    item_timeout: Duration,
    progress: watch::Sender<BatchProgress>,
}

impl BatchRun {
    async fn run(self, first: ResourceHandle) -> BatchReport {
        let total = self.items.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut first = Some(first);

        for (i, item) in self.items.iter().enumerate() {
            self.progress.send_modify(|p| {
                p.current_index = i + 1;
                p.current_progress = p.items[i].progress;
            });

            let handle = match first.take() {
                Some(handle) => handle,
                None => {
                    send_logged(
                        self.link.as_ref(),
                        Command::BatchItemStarting {
                            file_name: item.name.clone(),
                            index: (i + 1) as u32,
                            total: total as u32,
                        },
                    )
                    .await;
                    match self.link.send_resource(&item.name, &item.path).await {
                        Ok(handle) => handle,
                        Err(e) => {
                            warn!("Item '{}' could not start: {e}", item.name);
                            self.finish_item(i, ItemOutcome::Cancelled);
                            outcomes.push(ItemOutcome::Cancelled);
                            continue;
                        }
                    }
                }
            };

            self.progress.send_modify(|p| p.items[i].state = ItemState::InFlight);

            let outcome = self.await_item(i, &handle).await;
            debug!("Item {}/{total} '{}': {outcome:?}", i + 1, item.name);
            self.finish_item(i, outcome);
            outcomes.push(outcome);
        }

        send_logged(self.link.as_ref(), Command::BatchComplete).await;

        let report = BatchReport::from_outcomes(outcomes);
        info!(
            "Batch finished: {}/{} succeeded ({:?})",
            report.success_count,
            report.total,
            report.result()
        );
        report
    }

    /// Race completion, cancellation and the item timeout.
    async fn await_item(&self, index: usize, handle: &ResourceHandle) -> ItemOutcome {
        let mut status = handle.subscribe();
        let deadline = tokio::time::sleep(self.item_timeout);
        tokio::pin!(deadline);

        loop {
            let current = *status.borrow_and_update();
            match current {
                ResourceStatus::Completed => return ItemOutcome::Succeeded,
                ResourceStatus::Cancelled => return ItemOutcome::Cancelled,
                ResourceStatus::InFlight(fraction) => self.report_progress(index, fraction),
            }

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        let last = *status.borrow();
                        return match last {
                            ResourceStatus::Completed => ItemOutcome::Succeeded,
                            _ => ItemOutcome::Cancelled,
                        };
                    }
                }
                _ = &mut deadline => {
                    warn!(
                        "'{}' timed out after {:?}",
                        handle.name(),
                        self.item_timeout
                    );
                    handle.cancel();
                    return ItemOutcome::TimedOut;
                }
            }
        }
    }

    fn report_progress(&self, index: usize, fraction: f64) {
        self.progress.send_if_modified(|p| {
            let item = &mut p.items[index];
            if fraction <= item.progress {
                return false;
            }
            item.progress = fraction.min(1.0);
            p.current_progress = item.progress;
            true
        });
    }

    fn finish_item(&self, index: usize, outcome: ItemOutcome) {
        self.progress.send_modify(|p| {
            let item = &mut p.items[index];
            item.state = ItemState::Done(outcome);
            if outcome == ItemOutcome::Succeeded {
                item.progress = 1.0;
            }
            if p.current_index == index + 1 {
                p.current_progress = item.progress;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
