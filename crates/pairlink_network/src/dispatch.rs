//! Receiving-side command dispatcher.
//!
//! Applies decoded commands on the device that is being driven: text and
//! editing commands go to an [`InputSimulator`], settings commands update
//! local state, and batch commands drive an [`IncomingBatch`] tracker.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::command::Command;

/// Failure of the input simulation facility.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("input simulation not permitted: {0}")]
    PermissionDenied(String),

    #[error("input simulation failed: {0}")]
    Failed(String),
}

/// Permission-gated keyboard/mouse simulation.
pub trait InputSimulator: Send + Sync {
    /// Perform the side effect of a text or editing command.
    fn simulate(&self, command: &Command) -> Result<(), InputError>;

    /// Click the stored cursor position before typing.
    fn click_stored_position(&self) -> Result<(), InputError> {
        Ok(())
    }
}

/// A photo batch being received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingBatch {
    pub announced: Vec<String>,
    pub total: u32,
    /// `(index, file_name)` of the item currently streaming.
    pub current: Option<(u32, String)>,
    pub received: Vec<PathBuf>,
    pub complete: bool,
}

impl IncomingBatch {
    fn announced(file_names: Vec<String>) -> Self {
        Self {
            total: file_names.len() as u32,
            announced: file_names,
            ..Self::default()
        }
    }
}

type PermissionCallback = Box<dyn Fn(&Command, &InputError) + Send + Sync>;

pub struct CommandDispatcher {
    simulator: Box<dyn InputSimulator>,
    on_permission_denied: Option<PermissionCallback>,
    preview: String,
    pre_position_click: bool,
    remote_pre_position_click: Option<bool>,
    batch: Option<IncomingBatch>,
    received: u64,
}

impl CommandDispatcher {
    pub fn new(simulator: Box<dyn InputSimulator>) -> Self {
        Self {
            simulator,
            on_permission_denied: None,
            preview: String::new(),
            pre_position_click: false,
            remote_pre_position_click: None,
            batch: None,
            received: 0,
        }
    }

    /// Called when the simulator reports missing permission.
    pub fn on_permission_denied(
        mut self,
        callback: impl Fn(&Command, &InputError) + Send + Sync + 'static,
    ) -> Self {
        self.on_permission_denied = Some(Box::new(callback));
        self
    }

    /// Latest preview text.
    pub fn preview(&self) -> &str {
        &self.preview
    }

    pub fn pre_position_click(&self) -> bool {
        self.pre_position_click
    }

    /// The sender's setting as last reported by it.
    pub fn remote_pre_position_click(&self) -> Option<bool> {
        self.remote_pre_position_click
    }

    pub fn batch(&self) -> Option<&IncomingBatch> {
        self.batch.as_ref()
    }

    pub fn take_batch(&mut self) -> Option<IncomingBatch> {
        self.batch.take()
    }

    /// Commands received so far, including those the simulator refused.
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Apply one command. Returns a reply to send back, if any.
    pub fn dispatch(&mut self, command: Command) -> Option<Command> {
        self.received += 1;
        match command {
            Command::Preview { text } => {
                self.preview = text;
                None
            }
            Command::SetPrePositionClick { enabled } => {
                debug!("Pre-position click set to {enabled}");
                self.pre_position_click = enabled;
                Some(Command::PrePositionClickState { enabled })
            }
            Command::PrePositionClickState { enabled } => {
                self.remote_pre_position_click = Some(enabled);
                None
            }
            Command::BatchAnnounce { file_names } => {
                info!("Incoming batch of {} file(s)", file_names.len());
                if self.batch.as_ref().is_some_and(|b| !b.complete) {
                    warn!("New batch announced before the previous one completed");
                }
                self.batch = Some(IncomingBatch::announced(file_names));
                None
            }
            Command::BatchItemStarting {
                file_name,
                index,
                total,
            } => {
                let batch = self.batch.get_or_insert_with(IncomingBatch::default);
                batch.total = total;
                batch.current = Some((index, file_name));
                None
            }
            Command::BatchComplete => {
                if let Some(batch) = self.batch.as_mut() {
                    info!(
                        "Batch complete: {}/{} file(s) received",
                        batch.received.len(),
                        batch.total
                    );
                    batch.current = None;
                    batch.complete = true;
                }
                None
            }
            input => {
                self.simulate(&input);
                None
            }
        }
    }

    /// Record a resource that finished arriving.
    pub fn resource_received(&mut self, path: PathBuf) {
        match self.batch.as_mut() {
            Some(batch) if !batch.complete => batch.received.push(path),
            _ => debug!("Resource {} arrived outside a batch", path.display()),
        }
    }

    fn simulate(&self, command: &Command) {
        let types_text = matches!(
            command,
            Command::Insert { .. } | Command::InsertAndSubmit { .. }
        );
        let result = if types_text && self.pre_position_click {
            self.simulator
                .click_stored_position()
                .and_then(|()| self.simulator.simulate(command))
        } else {
            self.simulator.simulate(command)
        };

        match result {
            Ok(()) => {}
            Err(e @ InputError::PermissionDenied(_)) => {
                warn!("Cannot apply {}: {e}", command.kind());
                if let Some(callback) = &self.on_permission_denied {
                    callback(command, &e);
                }
            }
            Err(e) => warn!("Cannot apply {}: {e}", command.kind()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
