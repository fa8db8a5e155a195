// Zenoh event loop around one accelerometer
//
// Commands arrive as JSON on accel/<sensor>/cmd and are answered on
// accel/<sensor>/reply. While streaming, every batch is published on
// accel/<sensor>/data. The sensor state goes to accel/<sensor>/state on each
// tick.

use std::path::PathBuf;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::interval;
use tracing::{info, warn};

use crate::accelerometer::{Accelerometer, MeasureOutcome};
use crate::config::{topic, SensorConfig, BATCH_INTERVAL};
use crate::error::AccelError;
use crate::messages::{AccelBatch, AccelCommand, CommandReply, SensorHealth};

/// How the runtime reaches its sensor
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config: Option<PathBuf>,
    pub port: Option<String>,
    pub simulate: bool,
}

pub struct Runtime {
    accel: Accelerometer,
    stream: Option<UnboundedReceiver<AccelBatch>>,
    /// Set when the last operation hit a link or chip fault
    faulted: bool,
}

impl Runtime {
    pub fn new(accel: Accelerometer) -> Self {
        Self {
            accel,
            stream: None,
            faulted: false,
        }
    }

    pub fn health(&self) -> SensorHealth {
        if self.faulted {
            SensorHealth::Fault
        } else {
            self.accel.health()
        }
    }

    fn note_error(&mut self, e: &AccelError) {
        if e.is_connectivity() {
            self.faulted = true;
        }
    }

    /// Execute one command and build its reply
    pub async fn on_command(&mut self, cmd: AccelCommand) -> CommandReply {
        info!("Received command: {:?}", &cmd);
        match self.execute(cmd).await {
            Ok(message) => {
                self.faulted = false;
                CommandReply::ok(message)
            }
            Err(e) => {
                warn!("Command failed: {}", e);
                self.note_error(&e);
                CommandReply::error(e.to_string())
            }
        }
    }

    async fn execute(&mut self, cmd: AccelCommand) -> crate::error::Result<String> {
        let chip = self.accel.chip_info().name;
        match cmd {
            AccelCommand::Measure { name, rate } => {
                Ok(match self.accel.measure(name.as_deref(), rate)? {
                    MeasureOutcome::Started { name, rate } => {
                        format!("{} measurements '{}' started at {} Hz", chip, name, rate)
                    }
                    MeasureOutcome::Stopped { path, stats, .. } => {
                        format!("Writing raw accelerometer data to {} ({})", path.display(), stats)
                    }
                })
            }
            AccelCommand::Query => {
                let s = self.accel.query().await?;
                Ok(format!(
                    "{} values (x, y, z): {:.6}, {:.6}, {:.6}",
                    chip, s.x, s.y, s.z
                ))
            }
            AccelCommand::DebugRead { reg } => {
                let val = self.accel.debug_read(reg)?;
                Ok(format!("{} REG[{:#x}] = {:#x}", chip, reg, val))
            }
            AccelCommand::DebugWrite { reg, val } => {
                self.accel.debug_write(reg, val)?;
                Ok(format!("{} REG[{:#x}] <- {:#x}", chip, reg, val))
            }
            AccelCommand::Calibrate => {
                let report = self.accel.calibrate().await?;
                Ok(report.messages.join("\n"))
            }
            AccelCommand::SetProbe {
                tap_thresh,
                tap_dur,
            } => {
                self.accel.set_probe(tap_thresh, tap_dur)?;
                Ok(format!("{} probe updated", chip))
            }
            AccelCommand::Stream { enable: true } => {
                if self.stream.is_none() {
                    self.stream = Some(self.accel.subscribe()?);
                }
                Ok(format!("{} streaming", chip))
            }
            AccelCommand::Stream { enable: false } => {
                self.stream = None;
                self.accel.stop_streaming()?;
                Ok(format!("{} streaming stopped", chip))
            }
        }
    }

    /// Advance the batch pipeline and collect what it produced
    pub fn poll_batches(&mut self) -> Vec<AccelBatch> {
        if !self.accel.is_streaming() {
            self.stream = None;
            return Vec::new();
        }
        // A failed step has already stopped the session
        if let Err(e) = self.accel.step_batch() {
            warn!("Batch pipeline failed: {}", e);
            self.note_error(&e);
            self.stream = None;
            return Vec::new();
        }
        let mut batches = Vec::new();
        if let Some(rx) = self.stream.as_mut() {
            while let Ok(batch) = rx.try_recv() {
                batches.push(batch);
            }
        }
        batches
    }
}

fn load_config(options: &RuntimeOptions) -> crate::error::Result<SensorConfig> {
    let mut config = match &options.config {
        Some(path) => SensorConfig::load(path)?,
        None => SensorConfig::new(crate::chip::ChipKind::Adxl345),
    };
    if let Some(port) = &options.port {
        config.port = port.clone();
    }
    Ok(config)
}

pub async fn run(options: RuntimeOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = load_config(&options)?;
    let name = config.name.clone();
    let mut accel = if options.simulate {
        info!("Using simulated {} firmware", config.chip.info().name);
        Accelerometer::simulated(config)?.0
    } else {
        Accelerometer::open(config)?
    };

    // A probe must be calibrated from the start
    if accel.probe().is_some() {
        match accel.calibrate().await {
            Ok(report) => info!("Startup calibration: {:?}", report.outcome),
            Err(e) => warn!("Startup calibration failed: {}", e),
        }
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    let topic_cmd = topic(&name, "cmd");
    let topic_data = topic(&name, "data");
    let topic_state = topic(&name, "state");
    let topic_reply = topic(&name, "reply");

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(topic_cmd.as_str()).await?;
    let pub_data = session.declare_publisher(topic_data.as_str()).await?;
    let pub_state = session.declare_publisher(topic_state.as_str()).await?;
    let pub_reply = session.declare_publisher(topic_reply.as_str()).await?;

    let mut runtime = Runtime::new(accel);
    let mut tick = interval(BATCH_INTERVAL);

    info!(
        "Runtime started: {}ms batch interval",
        BATCH_INTERVAL.as_millis()
    );
    info!("Subscribed to: {}", topic_cmd);
    info!("Publishing to: {}, {}, {}", topic_data, topic_state, topic_reply);

    loop {
        tick.tick().await;

        // 1. Drain all pending commands (non-blocking), in order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            let reply = match serde_json::from_slice::<AccelCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd).await,
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                    CommandReply::error(format!("Invalid command: {}", e))
                }
            };
            pub_reply.put(serde_json::to_string(&reply)?).await?;
        }

        // 2. Publish streamed batches
        for batch in runtime.poll_batches() {
            pub_data.put(serde_json::to_string(&batch)?).await?;
        }

        // 3. Publish state
        let health_json = serde_json::to_string(&runtime.health())?;
        pub_state.put(health_json).await?;
    }
}
