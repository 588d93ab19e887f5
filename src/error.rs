use std::path::Path;

use thiserror::Error;

/// Errors surfaced to callers of the environment.
///
/// Transient pipe failures and frame stalls are recovered internally and never
/// show up here; a stall reaches the caller only as a terminal step.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Content path or emulator setup is missing or unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The emulator subprocess could not be started.
    #[error("unable to start emulator ({command}): {reason}")]
    Launch { command: String, reason: String },

    /// Action index outside the button table.
    #[error("unknown action index {index} (valid: 0..{count})")]
    UnknownAction { index: usize, count: usize },

    /// Malformed inbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),
}

impl EnvError {
    pub fn missing_content(path: &Path) -> Self {
        Self::Configuration(format!(
            "unable to find ROM at {}; configure the content path before reset",
            path.display()
        ))
    }
}

pub type Result<T> = std::result::Result<T, EnvError>;
