//! WGS84 coordinates helpers
use nalgebra::Vector3;

/// WGS84 semi major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;

/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Converts ECEF coordinates (m) to geodetic
/// (latitude (rad), longitude (rad), ellipsoidal height (m)).
pub fn ecef2geodetic(ecef: &Vector3<f64>) -> (f64, f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let r2 = ecef[0] * ecef[0] + ecef[1] * ecef[1];

    let mut z = ecef[2];
    let mut zk = 0.0;
    let mut v = WGS84_A;

    while (z - zk).abs() >= 1.0E-4 {
        zk = z;
        let sinp = z / (r2 + z * z).sqrt();
        v = WGS84_A / (1.0 - e2 * sinp * sinp).sqrt();
        z = ecef[2] + v * e2 * sinp;
    }

    let lat = if r2 > 1.0E-12 {
        (z / r2.sqrt()).atan()
    } else if ecef[2] > 0.0 {
        std::f64::consts::FRAC_PI_2
    } else {
        -std::f64::consts::FRAC_PI_2
    };

    let lon = if r2 > 1.0E-12 {
        ecef[1].atan2(ecef[0])
    } else {
        0.0
    };

    let alt = (r2 + z * z).sqrt() - v;
    (lat, lon, alt)
}

/// Converts geodetic coordinates (rad, rad, m) to ECEF (m)
pub fn geodetic2ecef(lat: f64, lon: f64, alt: f64) -> Vector3<f64> {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let (sinp, cosp) = lat.sin_cos();
    let (sinl, cosl) = lon.sin_cos();
    let v = WGS84_A / (1.0 - e2 * sinp * sinp).sqrt();

    Vector3::new(
        (v + alt) * cosp * cosl,
        (v + alt) * cosp * sinl,
        (v * (1.0 - e2) + alt) * sinp,
    )
}

/// Projects an ECEF vector into the local (east, north, up) frame at given geodetic position.
pub fn ecef2enu(lat: f64, lon: f64, r: &Vector3<f64>) -> Vector3<f64> {
    let (sinp, cosp) = lat.sin_cos();
    let (sinl, cosl) = lon.sin_cos();

    Vector3::new(
        -sinl * r[0] + cosl * r[1],
        -sinp * cosl * r[0] - sinp * sinl * r[1] + cosp * r[2],
        cosp * cosl * r[0] + cosp * sinl * r[1] + sinp * r[2],
    )
}

/// Returns (azimuth (rad), elevation (rad)) of the satellite seen from the receiver.
/// A receiver too close to earth center sees everything at zenith.
pub fn azimuth_elevation(rx_ecef: &Vector3<f64>, sv_ecef: &Vector3<f64>) -> (f64, f64) {
    if rx_ecef.norm() < WGS84_A * 0.5 {
        return (0.0, std::f64::consts::FRAC_PI_2);
    }

    let (lat, lon, _) = ecef2geodetic(rx_ecef);
    let los = sv_ecef - rx_ecef;
    let enu = ecef2enu(lat, lon, &(los / los.norm()));

    let mut az = enu[0].atan2(enu[1]);
    if az < 0.0 {
        az += 2.0 * std::f64::consts::PI;
    }

    (az, enu[2].asin())
}

/// Saastamoinen tropospheric delay (m) with standard atmosphere,
/// 70% relative humidity.
pub fn saastamoinen(lat: f64, alt: f64, elev: f64) -> f64 {
    if !(-100.0..=1.0E4).contains(&alt) || elev <= 0.0 {
        return 0.0;
    }

    let hgt = alt.max(0.0);
    let humi = 0.7;

    let pres = 1013.25 * (1.0 - 2.2557E-5 * hgt).powf(5.2568);
    let temp = 15.0 - 6.5E-3 * hgt + 273.16;
    let e = 6.108 * humi * ((17.15 * temp - 4684.0) / (temp - 38.45)).exp();

    let z = std::f64::consts::FRAC_PI_2 - elev;
    let trph = 0.0022768 * pres / (1.0 - 0.00266 * (2.0 * lat).cos() - 0.00028 * hgt / 1.0E3)
        / z.cos();
    let trpw = 0.002277 * (1255.0 / temp + 0.05) * e / z.cos();

    trph + trpw
}
