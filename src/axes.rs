// Axis remapping: raw chip axes -> logical (x, y, z) with sign and scale

use crate::error::{AccelError, Result};

/// One logical axis: which raw axis feeds it and the signed scale applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSource {
    pub index: usize,
    pub scale: f64,
}

/// Logical axis mapping, fixed once the sensor is configured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMap {
    axes: [AxisSource; 3],
}

impl AxisMap {
    /// Identity mapping with a uniform scale
    pub fn identity(scale: f64) -> Self {
        Self {
            axes: [
                AxisSource { index: 0, scale },
                AxisSource { index: 1, scale },
                AxisSource { index: 2, scale },
            ],
        }
    }

    /// Build from explicit sources; the indices must be a permutation of 0..3
    pub fn new(axes: [AxisSource; 3]) -> Result<Self> {
        let mut seen = [false; 3];
        for axis in &axes {
            if axis.index > 2 || seen[axis.index] || axis.scale == 0. {
                return Err(AccelError::Configuration(format!(
                    "Invalid axes_map: {:?}",
                    axes
                )));
            }
            seen[axis.index] = true;
        }
        Ok(Self { axes })
    }

    /// Parse a config string such as "x,-z,y"
    pub fn parse(spec: &str, scale: f64) -> Result<Self> {
        let parts: Vec<&str> = spec.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(AccelError::Configuration(format!(
                "Invalid axes_map parameter '{}'",
                spec
            )));
        }
        let mut axes = [AxisSource { index: 0, scale }; 3];
        for (slot, part) in axes.iter_mut().zip(&parts) {
            *slot = match *part {
                "x" => AxisSource { index: 0, scale },
                "y" => AxisSource { index: 1, scale },
                "z" => AxisSource { index: 2, scale },
                "-x" => AxisSource { index: 0, scale: -scale },
                "-y" => AxisSource { index: 1, scale: -scale },
                "-z" => AxisSource { index: 2, scale: -scale },
                _ => {
                    return Err(AccelError::Configuration(format!(
                        "Invalid axes_map parameter '{}'",
                        spec
                    )));
                }
            };
        }
        Self::new(axes)
    }

    pub fn axis(&self, logical: usize) -> AxisSource {
        self.axes[logical]
    }

    /// Apply the mapping to one raw reading
    pub fn apply(&self, raw: [i32; 3]) -> [f64; 3] {
        let [x, y, z] = self.axes;
        [
            raw[x.index] as f64 * x.scale,
            raw[y.index] as f64 * y.scale,
            raw[z.index] as f64 * z.scale,
        ]
    }

    /// Inverse of `apply`, rounded to the nearest raw count
    pub fn unapply(&self, value: [f64; 3]) -> [i32; 3] {
        let mut raw = [0i32; 3];
        for (logical, axis) in self.axes.iter().enumerate() {
            raw[axis.index] = (value[logical] / axis.scale).round() as i32;
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_permutation_and_sign() {
        let map = AxisMap::parse("y, -z, x", 2.0).unwrap();
        assert_eq!(map.axis(0), AxisSource { index: 1, scale: 2.0 });
        assert_eq!(map.axis(1), AxisSource { index: 2, scale: -2.0 });
        assert_eq!(map.apply([1, 2, 3]), [4.0, -6.0, 2.0]);
    }

    #[test]
    fn test_parse_rejects_duplicates_and_junk() {
        assert!(AxisMap::parse("x,x,z", 1.0).is_err());
        assert!(AxisMap::parse("x,y", 1.0).is_err());
        assert!(AxisMap::parse("x,y,w", 1.0).is_err());
    }

    #[test]
    fn test_unapply_recovers_raw() {
        let map = AxisMap::parse("-y,z,x", 38.25).unwrap();
        let raw = [-120, 7, 255];
        assert_eq!(map.unapply(map.apply(raw)), raw);
    }
}
