//! Position solutions, their buffer and output formats
use hifitime::Epoch;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

mod buffer;
mod output;

pub use buffer::SolutionBuffer;
pub use output::SolutionWriter;

use crate::coords::{ecef2enu, ecef2geodetic};

/// Solution quality
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    /// No position could be resolved
    #[default]
    NoFix,
    /// Single point positioning
    Single,
    /// Code differential positioning
    Dgps,
}

impl Quality {
    /// Quality flag of solution files
    pub fn flag(&self) -> u8 {
        match self {
            Self::NoFix => 0,
            Self::Dgps => 4,
            Self::Single => 5,
        }
    }

    /// NMEA GGA fix quality indicator
    pub fn gga_indicator(&self) -> u8 {
        match self {
            Self::NoFix => 0,
            Self::Single => 1,
            Self::Dgps => 2,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFix => write!(f, "no-fix"),
            Self::Single => write!(f, "single"),
            Self::Dgps => write!(f, "dgps"),
        }
    }
}

/// One position solution, per rover epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Rover sampling [Epoch]
    pub epoch: Epoch,
    /// ECEF position (m)
    pub position_ecef_m: [f64; 3],
    pub quality: Quality,
    /// Differential positioning was requested but could not be achieved
    pub degraded: bool,
    /// Per axis (ECEF) variance (m²)
    pub variance_m2: [f64; 3],
    /// Number of satellites used
    pub satellites: usize,
    /// Age of differential corrections (s)
    pub age_s: f64,
}

impl Solution {
    /// [Quality::NoFix] solution for this epoch
    pub fn no_fix(epoch: Epoch, degraded: bool) -> Self {
        Self {
            epoch,
            degraded,
            position_ecef_m: [0.0; 3],
            quality: Quality::NoFix,
            variance_m2: [0.0; 3],
            satellites: 0,
            age_s: 0.0,
        }
    }

    pub fn is_fix(&self) -> bool {
        self.quality != Quality::NoFix
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::from(self.position_ecef_m)
    }

    /// (latitude (ddeg), longitude (ddeg), ellipsoidal height (m))
    pub fn geodetic(&self) -> (f64, f64, f64) {
        let (lat, lon, h) = ecef2geodetic(&self.position());
        (lat.to_degrees(), lon.to_degrees(), h)
    }

    /// Standard deviations projected in the local (east, north, up) frame (m)
    pub fn enu_std_m(&self) -> Vector3<f64> {
        let (lat, lon, _) = ecef2geodetic(&self.position());
        let mut variance = Vector3::zeros();

        for (axis, var) in self.variance_m2.iter().enumerate() {
            let mut unit = Vector3::zeros();
            unit[axis] = 1.0;
            let column = ecef2enu(lat, lon, &unit);
            variance += column.component_mul(&column) * *var;
        }

        variance.map(f64::sqrt)
    }
}
