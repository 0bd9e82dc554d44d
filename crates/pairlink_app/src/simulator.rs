use pairlink_network::{Command, InputError, InputSimulator};
use tracing::info;

/// Stands in for the platform keyboard facility: reports what would be
/// typed instead of typing it.
pub struct LoggingSimulator;

impl InputSimulator for LoggingSimulator {
    fn simulate(&self, command: &Command) -> Result<(), InputError> {
        match command {
            Command::Insert { text } => info!("type {text:?}"),
            Command::InsertAndSubmit { text } => info!("type {text:?} + return"),
            other => info!("key {}", other.kind()),
        }
        Ok(())
    }

    fn click_stored_position(&self) -> Result<(), InputError> {
        info!("click stored position");
        Ok(())
    }
}
