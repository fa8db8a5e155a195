// Error taxonomy for the accelerometer driver
//
// Connectivity and link faults abort the running operation, configuration
// errors are raised before any hardware traffic, calibration errors are the
// only ones retried (see calibration.rs), timeouts always leave the session
// finished.

use crate::link::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum AccelError {
    #[error("{0}\nThis is generally indicative of connection problems (e.g. faulty wiring) or a faulty chip.")]
    Connectivity(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Timeout reading {0} data")]
    Timeout(String),

    #[error("Firmware link error: {0}")]
    Link(#[from] LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AccelError {
    /// Faults that leave the hardware in an unknown state
    pub fn is_connectivity(&self) -> bool {
        matches!(self, AccelError::Connectivity(_) | AccelError::Link(_))
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
