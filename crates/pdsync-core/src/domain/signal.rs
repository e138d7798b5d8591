//! Engine control signals
//!
//! Signals are durable rows in the state store's `signals` table, pushed by
//! the CLI and consumed FIFO by the engine's control loop. The queue is the
//! only IPC channel between `pdsync stop|pause|resume` and a running
//! `pdsync start`.

use super::errors::DomainError;

/// A control-plane command for the running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop accepting jobs, drain in-flight work, exit cleanly
    Stop,
    /// Keep running but stop claiming new jobs
    Pause,
    /// Undo a previous pause
    Resume,
    /// Re-read the configuration file
    Reload,
}

impl ControlSignal {
    /// Stored tag for this signal.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Stop => "stop",
            ControlSignal::Pause => "pause",
            ControlSignal::Resume => "resume",
            ControlSignal::Reload => "reload",
        }
    }

    /// Parse a stored tag.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "stop" => Ok(ControlSignal::Stop),
            "pause" => Ok(ControlSignal::Pause),
            "resume" => Ok(ControlSignal::Resume),
            "reload" => Ok(ControlSignal::Reload),
            other => Err(DomainError::UnknownVariant {
                what: "control signal",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
