// Message types exchanged over zenoh

use serde::{Deserialize, Serialize};

use crate::decode::Sample;

// Command from scripts/tools -> runtime, tagged by "cmd"
// e.g. {"cmd":"measure","name":"x_axis","rate":1600}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AccelCommand {
    /// Toggle a named measurement (start if idle, stop and export if running)
    Measure {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        rate: Option<u32>,
    },
    /// Report the latest sample
    Query,
    DebugRead {
        reg: u8,
    },
    DebugWrite {
        reg: u8,
        val: u8,
    },
    /// Force probe [re-]calibration
    Calibrate,
    SetProbe {
        #[serde(default)]
        tap_thresh: Option<f64>,
        #[serde(default)]
        tap_dur: Option<f64>,
    },
    /// Start/stop publishing batches on the data topic
    Stream {
        enable: bool,
    },
}

/// One pipeline publication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccelBatch {
    pub data: Vec<Sample>,
    /// Samples missing from the stream since the session started
    pub errors: u64,
    /// Firmware-reported overflows so far
    pub overflows: u64,
}

impl AccelBatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Sensor state published by the runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SensorHealth {
    Idle,
    Measuring,
    Streaming,
    /// Last operation failed on the link or the chip
    Fault,
}

/// Answer to one AccelCommand
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandReply {
    pub ok: bool,
    pub message: String,
}

impl CommandReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}
