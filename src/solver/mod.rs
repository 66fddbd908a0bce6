//! Positioning core: rover/base epoch matching,
//! single point and code differential least squares.
use std::collections::HashMap;

use gnss::prelude::SV;
use hifitime::{Duration, Epoch};
use log::{debug, trace};
use nalgebra::{DMatrix, DVector, Vector3, Vector4};
use thiserror::Error;

mod matcher;

pub use matcher::{EpochMatcher, Matched};

use crate::{
    constants::{EARTH_ANGULAR_VEL_RAD, SPEED_OF_LIGHT_M_S},
    coords::{WGS84_A, azimuth_elevation, ecef2geodetic, saastamoinen},
    ephemeris::EphemerisStore,
    observation::ObservationEpoch,
    settings::{PositioningMode, ProcessingOptions},
    solution::{Quality, Solution},
    status::SatelliteStatus,
    utils::seconds_between,
};

/// Code measurement noise (m), zenith and elevation dependent terms
const SIGMA_ZENITH_M: f64 = 0.3;
const SIGMA_ELEVATION_M: f64 = 0.3;

/// Convergence threshold of the least squares (m)
const CONVERGENCE_M: f64 = 1.0E-4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("not enough satellites ({0})")]
    NotEnoughSatellites(usize),
    #[error("singular geometry")]
    SingularGeometry,
    #[error("no convergence after {0} iterations")]
    Divergence(usize),
    #[error("gdop {0:.1} exceeds limit")]
    Gdop(f64),
}

/// Base station observations and position, used in differential mode.
#[derive(Debug, Clone, Copy)]
pub struct BaseReference<'a> {
    pub epoch: &'a ObservationEpoch,
    /// ECEF (m)
    pub position_ecef_m: Vector3<f64>,
}

/// Satellite ready for the least squares
#[derive(Debug, Clone)]
struct Candidate {
    sv: SV,
    pseudo_range_m: f64,
    cn0_dbhz: f64,
    position: Vector3<f64>,
    clock_bias_s: f64,
}

#[derive(Debug, Clone)]
struct Fix {
    position: Vector3<f64>,
    variance_m2: [f64; 3],
    used: Vec<SV>,
}

/// Geometric range (m) with Earth rotation correction, and line of sight.
fn geometric_range(sv: &Vector3<f64>, rx: &Vector3<f64>) -> (f64, Vector3<f64>) {
    let los = sv - rx;
    let norm = los.norm();
    let sagnac = EARTH_ANGULAR_VEL_RAD * (sv[0] * rx[1] - sv[1] * rx[0]) / SPEED_OF_LIGHT_M_S;
    (norm + sagnac, los / norm)
}

/// Positioning core, owned by the processing thread.
#[derive(Debug, Clone)]
pub struct Solver {
    options: ProcessingOptions,
    /// Last fixed position, initial guess of the next epoch
    last_position: Option<Vector3<f64>>,
    satellites: Vec<SatelliteStatus>,
    last_error: Option<Error>,
}

impl Solver {
    pub fn new(options: ProcessingOptions) -> Self {
        Self {
            options,
            last_position: None,
            satellites: Vec::new(),
            last_error: None,
        }
    }

    /// Tracking status of the satellites of the last rover epoch
    pub fn satellites(&self) -> &[SatelliteStatus] {
        &self.satellites
    }

    /// Reason of the last [Quality::NoFix] solution, cleared on next fix.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    fn position_is_meaningful(position: &Vector3<f64>) -> bool {
        position.norm() > WGS84_A * 0.5
    }

    /// Evaluates satellite states at transmission time.
    /// Satellites without valid ephemeris are excluded.
    fn candidates(epoch: &ObservationEpoch, ephemerides: &EphemerisStore) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(epoch.measurements.len());

        for measurement in epoch.l1_code_measurements() {
            let Some(pseudo_range_m) = measurement.pseudo_range_m else {
                continue;
            };

            let Some(ephemeris) = ephemerides.select(measurement.sv, epoch.epoch) else {
                trace!("{}({}) - no valid ephemeris", epoch.epoch, measurement.sv);
                continue;
            };

            let mut t_tx = epoch.epoch - Duration::from_seconds(pseudo_range_m / SPEED_OF_LIGHT_M_S);
            t_tx = t_tx - Duration::from_seconds(ephemeris.clock_polynomial_s(t_tx));

            let state = ephemeris.satellite_state(t_tx);

            candidates.push(Candidate {
                sv: measurement.sv,
                pseudo_range_m,
                cn0_dbhz: measurement.cn0_dbhz,
                position: state.position,
                clock_bias_s: state.clock_bias_s,
            });
        }

        candidates
    }

    fn troposphere(&self, rx: &Vector3<f64>, elevation: f64) -> f64 {
        if !self.options.troposphere || !Self::position_is_meaningful(rx) {
            return 0.0;
        }
        let (lat, _, alt) = ecef2geodetic(rx);
        saastamoinen(lat, alt, elevation)
    }

    /// Pseudo range corrections (m) observed at the base station
    fn corrections(
        &self,
        base: &BaseReference<'_>,
        ephemerides: &EphemerisStore,
    ) -> HashMap<SV, f64> {
        let mask = self.options.elevation_mask_deg.to_radians();

        Self::candidates(base.epoch, ephemerides)
            .into_iter()
            .filter_map(|candidate| {
                let (_, elevation) = azimuth_elevation(&base.position_ecef_m, &candidate.position);
                if elevation < mask {
                    return None;
                }

                let (range, _) = geometric_range(&candidate.position, &base.position_ecef_m);
                let modeled = range - SPEED_OF_LIGHT_M_S * candidate.clock_bias_s
                    + self.troposphere(&base.position_ecef_m, elevation);

                Some((candidate.sv, candidate.pseudo_range_m - modeled))
            })
            .collect()
    }

    /// Iterative weighted least squares over [x, y, z, c.dt]
    fn least_squares(&self, t: Epoch, candidates: &[Candidate]) -> Result<Fix, Error> {
        let mask = self.options.elevation_mask_deg.to_radians();
        let min_satellites = self.options.min_satellites.max(4);

        let mut x = Vector4::zeros();
        if let Some(position) = self.last_position {
            x.fixed_rows_mut::<3>(0).copy_from(&position);
        }

        for iteration in 0..self.options.max_iterations {
            let rx = x.xyz();
            let meaningful = Self::position_is_meaningful(&rx);

            let mut rows = Vec::with_capacity(candidates.len());

            for candidate in candidates {
                let (range, los) = geometric_range(&candidate.position, &rx);

                let elevation = if meaningful {
                    let (_, elevation) = azimuth_elevation(&rx, &candidate.position);
                    if elevation < mask {
                        continue;
                    }
                    elevation
                } else {
                    std::f64::consts::FRAC_PI_2
                };

                let modeled = range + x[3] - SPEED_OF_LIGHT_M_S * candidate.clock_bias_s
                    + self.troposphere(&rx, elevation);

                let variance = if meaningful {
                    SIGMA_ZENITH_M.powi(2) + (SIGMA_ELEVATION_M / elevation.sin()).powi(2)
                } else {
                    1.0
                };

                rows.push((candidate.sv, los, candidate.pseudo_range_m - modeled, variance));
            }

            if rows.len() < min_satellites {
                return Err(Error::NotEnoughSatellites(rows.len()));
            }

            let n = rows.len();
            let mut h = DMatrix::<f64>::zeros(n, 4);
            let mut w = DMatrix::<f64>::zeros(n, n);
            let mut v = DVector::<f64>::zeros(n);

            for (i, (_, los, residual, variance)) in rows.iter().enumerate() {
                h[(i, 0)] = -los[0];
                h[(i, 1)] = -los[1];
                h[(i, 2)] = -los[2];
                h[(i, 3)] = 1.0;
                w[(i, i)] = 1.0 / variance;
                v[i] = *residual;
            }

            let ht_w = h.transpose() * &w;
            let covariance = (&ht_w * &h)
                .try_inverse()
                .ok_or(Error::SingularGeometry)?;

            let dx = &covariance * (&ht_w * &v);
            x += Vector4::new(dx[0], dx[1], dx[2], dx[3]);

            if dx.norm() < CONVERGENCE_M {
                let q = (h.transpose() * &h)
                    .try_inverse()
                    .ok_or(Error::SingularGeometry)?;

                let gdop = q.trace().sqrt();
                if gdop > self.options.max_gdop {
                    return Err(Error::Gdop(gdop));
                }

                trace!("{} - converged after {} iterations", t, iteration + 1);

                return Ok(Fix {
                    position: x.xyz(),
                    variance_m2: [covariance[(0, 0)], covariance[(1, 1)], covariance[(2, 2)]],
                    used: rows.iter().map(|(sv, ..)| *sv).collect(),
                });
            }
        }

        Err(Error::Divergence(self.options.max_iterations))
    }

    /// Refreshes the tracking status, seen from this position.
    fn update_satellites(
        &mut self,
        rover: &ObservationEpoch,
        candidates: &[Candidate],
        position: Option<Vector3<f64>>,
        used: &[SV],
    ) {
        self.satellites = rover
            .l1_code_measurements()
            .map(|measurement| {
                let (azimuth, elevation) = match (
                    position,
                    candidates.iter().find(|c| c.sv == measurement.sv),
                ) {
                    (Some(rx), Some(candidate)) => azimuth_elevation(&rx, &candidate.position),
                    _ => (0.0, 0.0),
                };

                SatelliteStatus {
                    sv: measurement.sv,
                    azimuth_deg: azimuth.to_degrees(),
                    elevation_deg: elevation.to_degrees(),
                    cn0_dbhz: measurement.cn0_dbhz,
                    valid: used.contains(&measurement.sv),
                }
            })
            .collect();
    }

    /// Resolves the position of this rover epoch.
    /// Differential positioning is attempted when a base reference is provided,
    /// falling back to single point positioning (`degraded`) otherwise.
    /// Never fails: unresolved epochs produce a [Quality::NoFix] [Solution].
    pub fn fuse(
        &mut self,
        rover: &ObservationEpoch,
        base: Option<BaseReference<'_>>,
        ephemerides: &EphemerisStore,
    ) -> Solution {
        let differential = self.options.mode == PositioningMode::Dgps;
        let mut degraded = differential && base.is_none();

        let mut candidates = Self::candidates(rover, ephemerides);
        let mut quality = Quality::Single;
        let mut age_s = 0.0;

        if let (true, Some(base)) = (differential, base) {
            let corrections = self.corrections(&base, ephemerides);

            let common = candidates
                .iter()
                .filter(|c| corrections.contains_key(&c.sv))
                .count();

            if common >= self.options.min_satellites.max(4) {
                candidates.retain_mut(|candidate| match corrections.get(&candidate.sv) {
                    Some(correction) => {
                        candidate.pseudo_range_m -= correction;
                        true
                    },
                    None => false,
                });

                quality = Quality::Dgps;
                age_s = seconds_between(rover.epoch, base.epoch.epoch).abs();
            } else {
                debug!(
                    "{} - {} common satellites with base: single point positioning",
                    rover.epoch, common
                );
                degraded = true;
            }
        }

        match self.least_squares(rover.epoch, &candidates) {
            Ok(fix) => {
                self.update_satellites(rover, &candidates, Some(fix.position), &fix.used);
                self.last_position = Some(fix.position);
                self.last_error = None;

                Solution {
                    epoch: rover.epoch,
                    position_ecef_m: [fix.position[0], fix.position[1], fix.position[2]],
                    quality,
                    degraded,
                    variance_m2: fix.variance_m2,
                    satellites: fix.used.len(),
                    age_s,
                }
            },
            Err(e) => {
                debug!("{} - no fix: {}", rover.epoch, e);
                let position = self.last_position;
                self.update_satellites(rover, &candidates, position, &[]);
                self.last_error = Some(e);
                Solution::no_fix(rover.epoch, degraded)
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        coords::geodetic2ecef,
        ephemeris::{Ephemeris, test::test_ephemeris},
        observation::{Carrier, Measurement, ReceiverRole},
        utils::gpst_epoch,
    };

    pub(crate) const WEEK: u32 = 2430;
    pub(crate) const TOE_S: f64 = 345_600.0;

    pub(crate) fn ephemerides() -> Vec<Ephemeris> {
        (1..=32).map(|prn| test_ephemeris(prn, WEEK, TOE_S)).collect()
    }

    pub(crate) fn store() -> EphemerisStore {
        let mut store = EphemerisStore::new(7200.0);
        for ephemeris in ephemerides() {
            store.insert(ephemeris);
        }
        store
    }

    pub(crate) fn rover_position() -> Vector3<f64> {
        geodetic2ecef(45.0_f64.to_radians(), 5.0_f64.to_radians(), 100.0)
    }

    /// Synthesizes the L1 pseudo ranges observed at `rx` and `t`,
    /// for satellites above 15°, with a receiver clock offset and a per satellite bias.
    pub(crate) fn synthetic_epoch(
        role: ReceiverRole,
        t: Epoch,
        rx: &Vector3<f64>,
        clock_s: f64,
        bias_m: impl Fn(SV) -> f64,
    ) -> ObservationEpoch {
        let mut epoch = ObservationEpoch::new(role, t);

        for ephemeris in ephemerides() {
            let mut tau = 0.07;
            let mut state = ephemeris.satellite_state(t);
            let mut range = 0.0;

            for _ in 0..5 {
                state = ephemeris.satellite_state(t - Duration::from_seconds(tau));
                range = geometric_range(&state.position, rx).0;
                tau = range / SPEED_OF_LIGHT_M_S;
            }

            let (_, elevation) = azimuth_elevation(rx, &state.position);
            if elevation.to_degrees() < 15.0 {
                continue;
            }

            let pseudo_range_m = range + SPEED_OF_LIGHT_M_S * (clock_s - state.clock_bias_s)
                + bias_m(ephemeris.sv);

            epoch.measurements.push(Measurement {
                sv: ephemeris.sv,
                carrier: Carrier::L1,
                pseudo_range_m: Some(pseudo_range_m),
                carrier_phase_cycles: None,
                doppler_hz: None,
                cn0_dbhz: 45.0,
            });
        }

        epoch
    }

    fn options(mode: PositioningMode) -> ProcessingOptions {
        ProcessingOptions {
            mode,
            troposphere: false,
            ..Default::default()
        }
    }

    /// Atmospheric-like error, common to receivers close to one another
    fn bias(sv: SV) -> f64 {
        (sv.prn as f64 * 7.0) % 13.0 * 2.0
    }

    #[test]
    fn single_point_positioning() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, |_| 0.0);
        assert!(rover.measurements.len() >= 6);

        let mut solver = Solver::new(options(PositioningMode::Single));
        let solution = solver.fuse(&rover, None, &store());

        assert_eq!(solution.quality, Quality::Single);
        assert!(!solution.degraded);
        assert_eq!(solution.satellites, rover.measurements.len());
        assert!((solution.position() - rx).norm() < 0.5);
        assert!(solution.variance_m2.iter().all(|v| *v > 0.0));

        let status = solver.satellites();
        assert_eq!(status.len(), rover.measurements.len());
        assert!(status.iter().all(|s| s.valid && s.elevation_deg > 14.0));
    }

    #[test]
    fn differential_positioning() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let base_position =
            geodetic2ecef(45.05_f64.to_radians(), 5.05_f64.to_radians(), 150.0);

        let rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, bias);
        let base = synthetic_epoch(ReceiverRole::Base, t, &base_position, -2.0E-5, bias);

        let mut solver = Solver::new(options(PositioningMode::Dgps));
        let solution = solver.fuse(
            &rover,
            Some(BaseReference {
                epoch: &base,
                position_ecef_m: base_position,
            }),
            &store(),
        );

        assert_eq!(solution.quality, Quality::Dgps);
        assert!(!solution.degraded);
        assert_eq!(solution.age_s, 0.0);
        assert!((solution.position() - rx).norm() < 0.5);
    }

    #[test]
    fn missing_base_degrades() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, |_| 0.0);

        let mut solver = Solver::new(options(PositioningMode::Dgps));
        let solution = solver.fuse(&rover, None, &store());

        assert_eq!(solution.quality, Quality::Single);
        assert!(solution.degraded);
    }

    #[test]
    fn not_enough_satellites() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let mut rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, |_| 0.0);
        rover.measurements.truncate(3);

        let mut solver = Solver::new(options(PositioningMode::Single));
        let solution = solver.fuse(&rover, None, &store());

        assert_eq!(solution.quality, Quality::NoFix);
        assert!(!solution.is_fix());
        assert_eq!(solver.last_error(), Some(&Error::NotEnoughSatellites(3)));
        assert!(solver.satellites().iter().all(|s| !s.valid));
    }

    #[test]
    fn expired_ephemerides_are_excluded() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, |_| 0.0);

        let mut store = EphemerisStore::new(30.0);
        for ephemeris in ephemerides() {
            store.insert(ephemeris);
        }

        let mut solver = Solver::new(options(PositioningMode::Single));
        let solution = solver.fuse(&rover, None, &store);
        assert_eq!(solution.quality, Quality::NoFix);
        assert_eq!(solver.last_error(), Some(&Error::NotEnoughSatellites(0)));
    }

    #[test]
    fn gdop_rejection() {
        let t = gpst_epoch(WEEK, TOE_S + 60.0);
        let rx = rover_position();
        let rover = synthetic_epoch(ReceiverRole::Rover, t, &rx, 1.0E-5, |_| 0.0);

        let mut solver = Solver::new(ProcessingOptions {
            max_gdop: 0.5,
            ..options(PositioningMode::Single)
        });

        let solution = solver.fuse(&rover, None, &store());
        assert_eq!(solution.quality, Quality::NoFix);
        assert!(matches!(solver.last_error(), Some(Error::Gdop(_))));
    }
}
