#![allow(dead_code)]
use std::time::{Duration, Instant};

use nalgebra::Vector3;

use rtksvr::{
    constants::{EARTH_ANGULAR_VEL_RAD, SC2RAD, SPEED_OF_LIGHT_M_S},
    coords::{azimuth_elevation, geodetic2ecef},
    ephemeris::Ephemeris,
    prelude::{Constellation, Decoder, Message, ReceiverRole, SV, StreamFormat},
    utils::gpst_epoch,
};

pub const WEEK: u32 = 2430;
pub const TOE_S: f64 = 345_600.0;

/// Rover receiver clock offset (s)
pub const ROVER_CLOCK_S: f64 = 1.0E-5;

const P2_5: f64 = 1.0 / 32.0;
const P2_19: f64 = 1.0 / 524_288.0;
const P2_29: f64 = 1.0 / 536_870_912.0;
const P2_31: f64 = 1.0 / 2_147_483_648.0;
const P2_33: f64 = 1.0 / 8_589_934_592.0;
const P2_43: f64 = 1.0 / 8_796_093_022_208.0;
const P2_55: f64 = 1.0 / 36_028_797_018_963_968.0;

/// Unique temporary file path
pub fn temp_path(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("rtksvr-{}-{}", std::process::id(), name))
        .to_string_lossy()
        .to_string()
}

/// Polls `condition` until it holds, or the timeout expires.
pub fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn rover_position() -> Vector3<f64> {
    geodetic2ecef(45.0_f64.to_radians(), 5.0_f64.to_radians(), 100.0)
}

fn setbitu(buf: &mut [u8], pos: usize, len: usize, value: u32) {
    for i in 0..len {
        let bit = (value >> (len - 1 - i)) & 1;
        let idx = pos + i;
        let mask = 1u8 << (7 - idx % 8);
        if bit == 1 {
            buf[idx / 8] |= mask;
        } else {
            buf[idx / 8] &= !mask;
        }
    }
}

fn setbits(buf: &mut [u8], pos: usize, len: usize, value: i32) {
    let mask = if len >= 32 { !0u32 } else { (1u32 << len) - 1 };
    setbitu(buf, pos, len, (value as u32) & mask);
}

/// Nominal GPS orbit, spread by PRN
fn nominal_ephemeris(prn: u8) -> Ephemeris {
    Ephemeris {
        sv: SV::new(Constellation::GPS, prn),
        week: WEEK,
        toe_s: TOE_S,
        toc_s: TOE_S,
        iode: 7,
        iodc: 7,
        health: 0,
        fit_interval_h: 4.0,
        sqrt_a: 5153.5,
        e: 0.0078125,
        i0: 0.3046875 * SC2RAD,
        omega0: ((prn as f64 * 21.0 / 64.0) % 2.0 - 1.0) * SC2RAD,
        omega: 0.25 * SC2RAD,
        m0: ((prn as f64 * 37.0 / 64.0) % 2.0 - 1.0) * SC2RAD,
        delta_n: 0.0,
        idot: 0.0,
        omega_dot: -22870.0 * P2_43 * SC2RAD,
        cuc: 0.0,
        cus: 0.0,
        crc: 0.0,
        crs: 0.0,
        cic: 0.0,
        cis: 0.0,
        af0: 1024.0 * P2_31,
        af1: 0.0,
        af2: 0.0,
        tgd: 0.0,
    }
}

/// GPS LNAV subframes 1-3, parity stripped
fn encode_subframes(eph: &Ephemeris) -> [[u8; 30]; 3] {
    let mut frames = [[0u8; 30]; 3];

    for (k, buf) in frames.iter_mut().enumerate() {
        setbitu(buf, 0, 8, 0x8b);
        setbitu(buf, 24, 17, (eph.toe_s / 6.0) as u32);
        setbitu(buf, 43, 3, k as u32 + 1);
    }

    let buf = &mut frames[0];
    setbitu(buf, 48, 10, eph.week % 1024);
    setbitu(buf, 64, 6, eph.health);
    setbitu(buf, 70, 2, eph.iodc >> 8);
    setbits(buf, 160, 8, (eph.tgd / P2_31).round() as i32);
    setbitu(buf, 168, 8, eph.iodc & 0xff);
    setbitu(buf, 176, 16, (eph.toc_s / 16.0) as u32);
    setbits(buf, 192, 8, (eph.af2 / P2_55).round() as i32);
    setbits(buf, 200, 16, (eph.af1 / P2_43).round() as i32);
    setbits(buf, 216, 22, (eph.af0 / P2_31).round() as i32);

    let buf = &mut frames[1];
    setbitu(buf, 48, 8, eph.iode);
    setbits(buf, 56, 16, (eph.crs / P2_5).round() as i32);
    setbits(buf, 72, 16, (eph.delta_n / SC2RAD / P2_43).round() as i32);
    setbits(buf, 88, 32, (eph.m0 / SC2RAD / P2_31).round() as i64 as i32);
    setbits(buf, 120, 16, (eph.cuc / P2_29).round() as i32);
    setbitu(buf, 136, 32, (eph.e / P2_33).round() as u32);
    setbits(buf, 168, 16, (eph.cus / P2_29).round() as i32);
    setbitu(buf, 184, 32, (eph.sqrt_a / P2_19).round() as u32);
    setbitu(buf, 216, 16, (eph.toe_s / 16.0) as u32);

    let buf = &mut frames[2];
    setbits(buf, 48, 16, (eph.cic / P2_29).round() as i32);
    setbits(buf, 64, 32, (eph.omega0 / SC2RAD / P2_31).round() as i64 as i32);
    setbits(buf, 96, 16, (eph.cis / P2_29).round() as i32);
    setbits(buf, 112, 32, (eph.i0 / SC2RAD / P2_31).round() as i64 as i32);
    setbits(buf, 144, 16, (eph.crc / P2_5).round() as i32);
    setbits(buf, 160, 32, (eph.omega / SC2RAD / P2_31).round() as i64 as i32);
    setbits(buf, 192, 24, (eph.omega_dot / SC2RAD / P2_43).round() as i32);
    setbitu(buf, 216, 8, eph.iode);
    setbits(buf, 224, 14, (eph.idot / SC2RAD / P2_43).round() as i32);

    frames
}

/// Complete UBX frame
pub fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0xb5, 0x62, class, id];
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);

    let (mut ck_a, mut ck_b) = (0u8, 0u8);
    for byte in &frame[2..] {
        ck_a = ck_a.wrapping_add(*byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }

    frame.push(ck_a);
    frame.push(ck_b);
    frame
}

/// RXM-SFRBX frames of one satellite, and the [Ephemeris] they describe once decoded.
pub fn sfrbx_frames(prn: u8) -> (Vec<Vec<u8>>, Ephemeris) {
    let nominal = nominal_ephemeris(prn);
    let subframes = encode_subframes(&nominal);

    let mut decoder = Decoder::new(ReceiverRole::Rover, StreamFormat::Ubx, 4096, "");
    decoder.set_time_reference(gpst_epoch(WEEK, TOE_S));

    let mut frames = Vec::with_capacity(3);

    for subframe in subframes.iter() {
        let mut payload = vec![0, prn, 0, 0, 10, 0, 2, 0];
        for k in 0..10 {
            let data24 = u32::from_be_bytes([
                0,
                subframe[3 * k],
                subframe[3 * k + 1],
                subframe[3 * k + 2],
            ]);
            payload.extend_from_slice(&(data24 << 6).to_le_bytes());
        }

        let frame = ubx_frame(0x02, 0x13, &payload);
        decoder.push(&frame);
        frames.push(frame);
    }

    let ephemeris = decoder
        .decode()
        .into_iter()
        .find_map(|msg| match msg {
            Message::Ephemeris(ephemeris) => Some(ephemeris),
            _ => None,
        })
        .expect("consistent subframes");

    (frames, ephemeris)
}

/// Geometric range with Earth rotation correction
fn geometric_range(sv: &Vector3<f64>, rx: &Vector3<f64>) -> f64 {
    (sv - rx).norm() + EARTH_ANGULAR_VEL_RAD * (sv[0] * rx[1] - sv[1] * rx[0]) / SPEED_OF_LIGHT_M_S
}

/// RXM-RAWX frame observed at `rx`, satellites above 15°
pub fn rawx_frame(tow_s: f64, rx: &Vector3<f64>, ephemerides: &[Ephemeris]) -> Vec<u8> {
    let t = gpst_epoch(WEEK, tow_s);
    let mut blocks = Vec::new();

    for ephemeris in ephemerides {
        let mut tau = 0.07;
        let mut state = ephemeris.satellite_state(t);
        let mut range = 0.0;

        for _ in 0..5 {
            state = ephemeris.satellite_state(t - hifitime::Duration::from_seconds(tau));
            range = geometric_range(&state.position, rx);
            tau = range / SPEED_OF_LIGHT_M_S;
        }

        let (_, elevation) = azimuth_elevation(rx, &state.position);
        if elevation.to_degrees() < 15.0 {
            continue;
        }

        let pr = range + SPEED_OF_LIGHT_M_S * (ROVER_CLOCK_S - state.clock_bias_s);

        let mut block = [0u8; 32];
        block[0..8].copy_from_slice(&pr.to_le_bytes());
        block[16..20].copy_from_slice(&(-1000.0f32).to_le_bytes());
        block[20] = 0;
        block[21] = ephemeris.sv.prn;
        block[22] = 0;
        block[26] = 45;
        block[30] = 0x01;
        blocks.push(block);
    }

    let mut payload = vec![0u8; 16];
    payload[0..8].copy_from_slice(&tow_s.to_le_bytes());
    payload[8..10].copy_from_slice(&(WEEK as u16).to_le_bytes());
    payload[11] = blocks.len() as u8;
    payload[13] = 1;

    for block in blocks {
        payload.extend_from_slice(&block);
    }

    ubx_frame(0x02, 0x15, &payload)
}

/// Rover stream: ephemerides of the whole constellation, then `epochs` 1Hz epochs
/// starting one minute after toe.
pub fn rover_stream(epochs: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    let mut ephemerides = Vec::with_capacity(32);

    for prn in 1..=32 {
        let (frames, ephemeris) = sfrbx_frames(prn);
        for frame in frames {
            stream.extend_from_slice(&frame);
        }
        ephemerides.push(ephemeris);
    }

    let rx = rover_position();

    for i in 0..epochs {
        stream.extend_from_slice(&rawx_frame(TOE_S + 60.0 + i as f64, &rx, &ephemerides));
    }

    stream
}
