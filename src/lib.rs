pub mod accelerometer;
pub mod axes;
pub mod calibration;
pub mod chip;
pub mod clock;
pub mod config;
pub mod decode;
pub mod error;
pub mod export;
pub mod link;
pub mod messages;
pub mod pipeline;
pub mod probe;
pub mod runtime;
pub mod sequence;
pub mod session;
