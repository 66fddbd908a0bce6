use std::collections::HashMap;

use gnss::prelude::SV;
use gnss_protos::{GpsQzssFrame, GpsQzssFrame1, GpsQzssFrame2, GpsQzssFrame3, GpsQzssSubframe};
use hifitime::Epoch;
use log::debug;
use nalgebra::Vector3;

use crate::{
    constants::{EARTH_ANGULAR_VEL_RAD, GPS_MU, RELATIVISTIC_F, SC2RAD},
    utils::{gpst_epoch, resolve_tow, resolve_week, seconds_between},
};

/// GPS LNAV broadcast ephemeris (Keplerian set + clock polynomial).
/// Angles are expressed in radians.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ephemeris {
    pub sv: SV,
    /// Full GPS week of toe
    pub week: u32,
    /// Time of ephemeris (s of week)
    pub toe_s: f64,
    /// Time of clock (s of week)
    pub toc_s: f64,
    pub iode: u32,
    pub iodc: u32,
    /// SV health bits, 0 means healthy
    pub health: u32,
    /// Fit interval (hours)
    pub fit_interval_h: f64,
    pub sqrt_a: f64,
    pub e: f64,
    pub i0: f64,
    pub omega0: f64,
    pub omega: f64,
    pub m0: f64,
    pub delta_n: f64,
    pub idot: f64,
    pub omega_dot: f64,
    pub cuc: f64,
    pub cus: f64,
    pub crc: f64,
    pub crs: f64,
    pub cic: f64,
    pub cis: f64,
    pub af0: f64,
    pub af1: f64,
    pub af2: f64,
    pub tgd: f64,
}

/// Satellite position and clock at a given instant
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SatelliteState {
    /// ECEF position (m)
    pub position: Vector3<f64>,
    /// L1 clock offset (s), relativistic effect and group delay included
    pub clock_bias_s: f64,
}

impl Ephemeris {
    /// Time of ephemeris, as [Epoch]
    pub fn toe(&self) -> Epoch {
        gpst_epoch(self.week, self.toe_s)
    }

    /// Time of clock, as [Epoch]
    pub fn toc(&self) -> Epoch {
        resolve_tow(self.toc_s, self.toe())
    }

    pub fn is_healthy(&self) -> bool {
        self.health == 0
    }

    /// True when this set may be used at `t`
    pub fn is_valid(&self, t: Epoch, max_age_s: f64) -> bool {
        seconds_between(t, self.toe()).abs() <= max_age_s
    }

    /// Clock polynomial only (s), used to estimate the transmission time.
    pub fn clock_polynomial_s(&self, t: Epoch) -> f64 {
        let mut dt = seconds_between(t, self.toc());
        for _ in 0..2 {
            dt -= self.af0 + self.af1 * dt + self.af2 * dt * dt;
        }
        self.af0 + self.af1 * dt + self.af2 * dt * dt
    }

    /// Evaluates satellite position and L1 clock offset at `t` (GPST),
    /// following IS-GPS-200 user algorithm.
    pub fn satellite_state(&self, t: Epoch) -> SatelliteState {
        let a = self.sqrt_a * self.sqrt_a;
        let tk = seconds_between(t, self.toe());

        let n = (GPS_MU / (a * a * a)).sqrt() + self.delta_n;
        let m = self.m0 + n * tk;

        let mut ecc_anomaly = m;
        for _ in 0..30 {
            let ek = ecc_anomaly;
            ecc_anomaly -= (ecc_anomaly - self.e * ecc_anomaly.sin() - m)
                / (1.0 - self.e * ecc_anomaly.cos());
            if (ecc_anomaly - ek).abs() < 1.0E-13 {
                break;
            }
        }

        let (sin_e, cos_e) = ecc_anomaly.sin_cos();

        let mut u = ((1.0 - self.e * self.e).sqrt() * sin_e).atan2(cos_e - self.e) + self.omega;
        let mut r = a * (1.0 - self.e * cos_e);
        let mut i = self.i0 + self.idot * tk;

        let (sin_2u, cos_2u) = (2.0 * u).sin_cos();

        u += self.cus * sin_2u + self.cuc * cos_2u;
        r += self.crs * sin_2u + self.crc * cos_2u;
        i += self.cis * sin_2u + self.cic * cos_2u;

        let (x, y) = (r * u.cos(), r * u.sin());
        let (sin_i, cos_i) = i.sin_cos();

        let omega = self.omega0 + (self.omega_dot - EARTH_ANGULAR_VEL_RAD) * tk
            - EARTH_ANGULAR_VEL_RAD * self.toe_s;

        let (sin_o, cos_o) = omega.sin_cos();

        let position = Vector3::new(
            x * cos_o - y * cos_i * sin_o,
            x * sin_o + y * cos_i * cos_o,
            y * sin_i,
        );

        let dt = seconds_between(t, self.toc());
        let clock_bias_s = self.af0 + self.af1 * dt + self.af2 * dt * dt
            + RELATIVISTIC_F * self.e * self.sqrt_a * sin_e
            - self.tgd;

        SatelliteState {
            position,
            clock_bias_s,
        }
    }
}

/// Subframes 1 to 3 collected for one satellite, until they form a consistent set.
#[derive(Debug, Default, Copy, Clone)]
pub struct PendingFrame {
    pub frame1: Option<GpsQzssFrame1>,
    pub frame2: Option<GpsQzssFrame2>,
    pub frame3: Option<GpsQzssFrame3>,
}

impl PendingFrame {
    pub fn update(&mut self, frame: GpsQzssFrame) {
        match frame.subframe {
            GpsQzssSubframe::Ephemeris1(subframe) => {
                self.frame1 = Some(subframe);
            },
            GpsQzssSubframe::Ephemeris2(subframe) => {
                self.frame2 = Some(subframe);
            },
            GpsQzssSubframe::Ephemeris3(subframe) => {
                self.frame3 = Some(subframe);
            },
        }
    }

    /// Returns an [Ephemeris] once all three subframes share the same issue of data.
    /// `reference_week` resolves the truncated week counter.
    pub fn validate(&self, sv: SV, reference_week: u32) -> Option<Ephemeris> {
        let frame1 = self.frame1?;
        let frame2 = self.frame2?;
        let frame3 = self.frame3?;

        if frame2.iode != frame3.iode || frame1.iodc as u8 != frame2.iode {
            return None;
        }

        // angles are broadcast in semi-circles
        Some(Ephemeris {
            sv,
            week: resolve_week(frame1.week as u32, reference_week),
            toe_s: frame2.toe as f64,
            toc_s: frame1.toc as f64,
            iode: frame2.iode as u32,
            iodc: frame1.iodc as u32,
            health: frame1.health as u32,
            fit_interval_h: if frame2.fit_int_flag { 6.0 } else { 4.0 },
            sqrt_a: frame2.sqrt_a,
            e: frame2.e,
            i0: frame3.i0 * SC2RAD,
            omega0: frame3.omega0 * SC2RAD,
            omega: frame3.omega * SC2RAD,
            m0: frame2.m0 * SC2RAD,
            delta_n: frame2.dn * SC2RAD,
            idot: frame3.idot * SC2RAD,
            omega_dot: frame3.omega_dot * SC2RAD,
            cuc: frame2.cuc,
            cus: frame2.cus,
            crc: frame3.crc,
            crs: frame2.crs,
            cic: frame3.cic,
            cis: frame3.cis,
            af0: frame1.af0,
            af1: frame1.af1,
            af2: frame1.af2,
            tgd: frame1.tgd,
        })
    }
}

/// Latest [Ephemeris] of each satellite.
#[derive(Debug, Clone)]
pub struct EphemerisStore {
    /// Validity window around toe (s)
    max_age_s: f64,
    inner: HashMap<SV, Ephemeris>,
}

impl EphemerisStore {
    pub fn new(max_age_s: f64) -> Self {
        Self {
            max_age_s,
            inner: HashMap::with_capacity(32),
        }
    }

    /// Stores this [Ephemeris], replacing the previous set of that satellite.
    /// Returns false when the same issue was already stored.
    pub fn insert(&mut self, ephemeris: Ephemeris) -> bool {
        if ephemeris.sqrt_a <= 0.0 {
            return false;
        }

        if let Some(stored) = self.inner.get(&ephemeris.sv) {
            if stored.iode == ephemeris.iode && stored.toe() == ephemeris.toe() {
                return false;
            }
        }

        debug!(
            "{}({}) - new ephemeris iode={}",
            ephemeris.toe(),
            ephemeris.sv,
            ephemeris.iode
        );

        self.inner.insert(ephemeris.sv, ephemeris);
        true
    }

    /// Selects the [Ephemeris] to be used for this satellite at `t`:
    /// must be healthy and within the validity window.
    pub fn select(&self, sv: SV, t: Epoch) -> Option<&Ephemeris> {
        let ephemeris = self.inner.get(&sv)?;
        if ephemeris.is_healthy() && ephemeris.is_valid(t, self.max_age_s) {
            Some(ephemeris)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
