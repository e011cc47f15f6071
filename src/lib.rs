//! # IoT IDE
//!
//! Application shell over the device link: settings, logging, and the
//! explicit wiring of transport, session, REPL, monitor and assistant that
//! the `iotide` command line drives.

pub mod app;
pub mod config;
pub mod logging;

pub use app::IdeContext;
pub use config::{ConfigError, IdeSettings};

use iotide_assistant::AssistantError;
use iotide_serial::serial::SerialError;

/// Top-level error for the command line.
#[derive(Debug, thiserror::Error)]
pub enum IdeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{}", .0.user_message())]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Assistant(#[from] AssistantError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Usage(String),
}

impl IdeError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }
}
