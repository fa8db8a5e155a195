// CSV export of finished measurements

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session::AccelResults;

/// `<dir>/<chip>-<name>.csv`, or `<dir>/<chip>-<sensor>-<name>.csv` for a
/// non-default sensor
pub fn export_path(dir: &Path, chip: &str, sensor: &str, name: &str) -> PathBuf {
    if sensor == "default" {
        dir.join(format!("{}-{}.csv", chip, name))
    } else {
        dir.join(format!("{}-{}-{}.csv", chip, sensor, name))
    }
}

/// Stats header, column header, then one row per decoded sample
pub fn write_csv<W: Write>(mut writer: W, results: &AccelResults) -> std::io::Result<()> {
    writeln!(writer, "##{}", results.stats())?;
    writeln!(writer, "#time,accel_x,accel_y,accel_z")?;
    for s in results.decode_samples() {
        writeln!(writer, "{:.6},{:.6},{:.6},{:.6}", s.time, s.x, s.y, s.z)?;
    }
    writer.flush()
}

pub fn write_csv_file(path: &Path, results: &AccelResults) -> std::io::Result<()> {
    write_csv(BufWriter::new(File::create(path)?), results)
}

/// Write the file on the blocking pool; failures are only logged
pub fn spawn_export(path: PathBuf, results: AccelResults) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || match write_csv_file(&path, &results) {
        Ok(()) => info!("Wrote {}", path.display()),
        Err(e) => warn!("Failed to write {}: {}", path.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axes::AxisMap;
    use crate::chip::{adxl345, ChipKind};
    use crate::link::sim::SimulatedFirmware;
    use crate::session::MeasurementSession;

    #[test]
    fn test_export_path() {
        let dir = Path::new("/tmp");
        assert_eq!(
            export_path(dir, "adxl345", "default", "run1"),
            PathBuf::from("/tmp/adxl345-run1.csv")
        );
        assert_eq!(
            export_path(dir, "lis2dw", "hotend", "run1"),
            PathBuf::from("/tmp/lis2dw-hotend-run1.csv")
        );
    }

    #[test]
    fn test_csv_format() {
        let sim = SimulatedFirmware::new(&adxl345::INFO);
        let mut session = MeasurementSession::new(
            ChipKind::Adxl345.build(),
            Box::new(sim.clone()),
            AxisMap::identity(adxl345::INFO.scale),
            0,
            1600,
        );
        session.start(None).unwrap();
        sim.advance_samples(16);
        let results = session.finish().unwrap();

        let mut out = Vec::new();
        write_csv(&mut out, &results).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 + 16);
        assert!(lines[0].starts_with("##drops=0,overflows=0,time_per_sample=0.000625000,"));
        assert_eq!(lines[1], "#time,accel_x,accel_y,accel_z");
        let fields: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[1], "0.000000");
        assert_eq!(fields[3], "9790.959360");
    }
}
