// End-to-end measurement sessions against the simulated firmware

use accel_zenoh_runtime::axes::AxisMap;
use accel_zenoh_runtime::chip::{adxl345, lis2dw, ChipKind};
use accel_zenoh_runtime::config::FREEFALL_ACCEL;
use accel_zenoh_runtime::error::AccelError;
use accel_zenoh_runtime::link::sim::SimulatedFirmware;
use accel_zenoh_runtime::session::MeasurementSession;

fn session(kind: ChipKind, sim: &SimulatedFirmware, axes: &str) -> MeasurementSession {
    let info = kind.info();
    MeasurementSession::new(
        kind.build(),
        Box::new(sim.clone()),
        AxisMap::parse(axes, info.scale).unwrap(),
        0,
        info.default_rate,
    )
}

#[test]
fn test_ramp_at_1600hz() {
    let sim = SimulatedFirmware::new(&adxl345::INFO);
    sim.set_signal(Box::new(|k| [k as i32, 0, 256]));
    let mut session = session(ChipKind::Adxl345, &sim, "x,y,z");

    session.start(Some(1600)).unwrap();
    sim.advance_samples(10 * 8);
    let results = session.finish().unwrap();

    assert_eq!(results.total_count, 80);
    assert_eq!(results.drops, 0);
    assert_eq!(results.overflows, 0);
    assert!((results.time_per_sample - 1. / 1600.).abs() < 1e-9);

    let samples = results.decode_samples();
    assert_eq!(samples.len(), 80);
    assert!(samples.windows(2).all(|w| w[1].time > w[0].time));
    for (k, s) in samples.iter().enumerate() {
        assert!((s.x - k as f64 * adxl345::INFO.scale).abs() < 1e-9);
        assert_eq!(s.y, 0.);
    }
    let first = samples[0];
    assert!((first.magnitude() - FREEFALL_ACCEL).abs() < FREEFALL_ACCEL * 0.01);
}

#[test]
fn test_axis_map_applied() {
    let sim = SimulatedFirmware::new(&adxl345::INFO);
    sim.set_signal(Box::new(|_| [10, 20, 256]));
    let mut session = session(ChipKind::Adxl345, &sim, "-z,x,y");
    session.start(Some(800)).unwrap();
    sim.advance_samples(8);
    let samples = session.finish().unwrap().decode_samples();
    let scale = adxl345::INFO.scale;
    assert_eq!(samples.len(), 8);
    assert!((samples[0].x + 256. * scale).abs() < 1e-9);
    assert!((samples[0].y - 10. * scale).abs() < 1e-9);
    assert!((samples[0].z - 20. * scale).abs() < 1e-9);
}

#[test]
fn test_lis2dw_session() {
    let sim = SimulatedFirmware::new(&lis2dw::INFO);
    let mut session = session(ChipKind::Lis2dw, &sim, "x,y,z");
    session.start(None).unwrap();
    assert_eq!(session.rate(), 1600);
    sim.advance_samples(20);
    let results = session.finish().unwrap();
    assert_eq!(results.total_count, 20);
    assert_eq!(sim.register(lis2dw::REG_FIFO_CTRL), 0x00);
    let samples = results.decode_samples();
    assert!((samples[19].z - FREEFALL_ACCEL).abs() < lis2dw::INFO.scale);
}

#[test]
fn test_drops_never_negative() {
    let sim = SimulatedFirmware::new(&adxl345::INFO);
    let mut session = session(ChipKind::Adxl345, &sim, "x,y,z");
    session.start(None).unwrap();
    let results = session.finish().unwrap();
    assert_eq!(results.total_count, 0);
    assert_eq!(results.drops, 0);
    assert!(results.decode_samples().is_empty());
}

#[test]
fn test_capacity_cap() {
    let sim = SimulatedFirmware::new(&adxl345::INFO);
    let info = &adxl345::INFO;
    let mut session = MeasurementSession::with_capacity(
        ChipKind::Adxl345.build(),
        Box::new(sim.clone()),
        AxisMap::identity(info.scale),
        0,
        info.default_rate,
        10,
    );
    session.start(None).unwrap();
    sim.advance_samples(25 * 8);
    let results = session.finish().unwrap();
    assert_eq!(results.raw_blocks().len(), 10);
    assert_eq!(results.drops, 15 * 8);
    assert_eq!(results.decode_samples().len(), 80);
}

#[test]
fn test_start_failures() {
    // Wrong chip on the bus
    let sim = SimulatedFirmware::new(&adxl345::INFO);
    sim.set_register(adxl345::REG_DEVID, lis2dw::DEV_ID);
    let mut s = session(ChipKind::Adxl345, &sim, "x,y,z");
    assert!(matches!(s.start(None), Err(AccelError::Connectivity(_))));

    // Register write does not stick
    let sim = SimulatedFirmware::new(&lis2dw::INFO);
    sim.set_stuck_register(lis2dw::REG_CTRL1);
    let mut s = session(ChipKind::Lis2dw, &sim, "x,y,z");
    assert!(matches!(s.start(None), Err(AccelError::Connectivity(_))));
    assert_eq!(sim.starts(), 0);

    // Unsupported rate: nothing reaches the hardware
    let sim = SimulatedFirmware::new(&lis2dw::INFO);
    let mut s = session(ChipKind::Lis2dw, &sim, "x,y,z");
    assert!(matches!(s.start(Some(3200)), Err(AccelError::Configuration(_))));
    assert_eq!(sim.register(lis2dw::REG_CTRL1), 0);
    assert_eq!(sim.starts(), 0);
}
