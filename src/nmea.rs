//! NMEA GGA sentences, for solution outputs and caster requests
use hifitime::Epoch;
use nalgebra::Vector3;

use crate::coords::ecef2geodetic;

/// NMEA checksum: XOR of all characters between `$` and `*`
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Completes a sentence body (without `$`) with `$`, checksum and CRLF
fn finalize(body: &str) -> String {
    format!("${}*{:02X}\r\n", body, checksum(body))
}

/// (degrees, minutes) with minutes rounded to 7 decimals
fn degrees_minutes(value: f64) -> (u32, f64) {
    let value = value.abs();
    let mut deg = value.floor();
    let mut min = (value - deg) * 60.0;

    if min >= 59.999_999_95 {
        deg += 1.0;
        min = 0.0;
    }

    (deg as u32, min)
}

/// UTC time field `hhmmss.ss`
fn utc_time(t: Epoch) -> String {
    let (_, _, _, hh, mm, ss, ns) = t.to_gregorian_utc();
    format!("{:02}{:02}{:05.2}", hh, mm, ss as f64 + ns as f64 * 1.0E-9)
}

/// GGA sentence for this ECEF position.
/// A null `quality` indicator produces an empty (invalid) position.
pub fn gga(
    t: Epoch,
    position_ecef_m: &Vector3<f64>,
    quality: u8,
    satellites: usize,
    hdop: f64,
    age_s: Option<f64>,
) -> String {
    if quality == 0 || position_ecef_m.norm() < 1.0 {
        return finalize(&format!("GPGGA,{},,,,,0,,,,,,,,", utc_time(t)));
    }

    let (lat, lon, height) = ecef2geodetic(position_ecef_m);
    let (lat, lon) = (lat.to_degrees(), lon.to_degrees());

    let (lat_deg, lat_min) = degrees_minutes(lat);
    let (lon_deg, lon_min) = degrees_minutes(lon);

    let age = match age_s {
        Some(age) => format!("{:.1}", age),
        None => String::new(),
    };

    let body = format!(
        "GPGGA,{},{:02}{:010.7},{},{:03}{:010.7},{},{},{:02},{:.1},{:.3},M,{:.3},M,{},",
        utc_time(t),
        lat_deg,
        lat_min,
        if lat >= 0.0 { "N" } else { "S" },
        lon_deg,
        lon_min,
        if lon >= 0.0 { "E" } else { "W" },
        quality,
        satellites.min(99),
        hdop,
        height,
        0.0,
        age,
    );

    finalize(&body)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{coords::geodetic2ecef, utils::gpst_epoch};

    #[test]
    fn reference_checksum() {
        let body = "GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,";
        assert_eq!(checksum(body), 0x76);
    }

    #[test]
    fn gga_sentence() {
        let position = geodetic2ecef(45.5_f64.to_radians(), (-5.25_f64).to_radians(), 120.0);
        let t = gpst_epoch(2300, 345_600.0);

        let sentence = gga(t, &position, 2, 9, 0.9, Some(1.5));
        assert!(sentence.starts_with("$GPGGA,"));
        assert!(sentence.ends_with("\r\n"));

        let fields = sentence.split(',').collect::<Vec<_>>();
        assert_eq!(fields[2], "4530.0000000");
        assert_eq!(fields[3], "N");
        assert_eq!(fields[4], "00515.0000000");
        assert_eq!(fields[5], "W");
        assert_eq!(fields[6], "2");
        assert_eq!(fields[7], "09");
        assert_eq!(fields[9], "120.000");
        assert_eq!(fields[13], "1.5");

        let (body, cs) = sentence[1..].trim_end().split_once('*').unwrap();
        assert_eq!(u8::from_str_radix(cs, 16).unwrap(), checksum(body));
    }

    #[test]
    fn invalid_position() {
        let t = gpst_epoch(2300, 345_600.0);
        let sentence = gga(t, &Vector3::zeros(), 0, 0, 0.0, None);
        assert!(sentence.contains(",0,,,,,,,,*"));
    }
}
