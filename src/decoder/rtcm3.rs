//! RTCM 3 framing and the GPS messages we rely on:
//! 1004 (L1/L2 observations), 1019 (ephemeris), 1005/1006 (station position).
use gnss::prelude::{Constellation, SV};
use log::{debug, trace};
use nalgebra::Vector3;

use crate::{
    constants::{PRUNIT_GPS, SC2RAD},
    decoder::{
        Context, Message,
        bits::{getbits, getbits_38, getbitu},
    },
    ephemeris::Ephemeris,
    observation::{Carrier, Measurement, ObservationEpoch},
    utils::{gpst_week_tow, resolve_tow, resolve_week},
};

const P2_5: f64 = 1.0 / 32.0;
const P2_19: f64 = 1.0 / 524_288.0;
const P2_29: f64 = 1.0 / 536_870_912.0;
const P2_31: f64 = 1.0 / 2_147_483_648.0;
const P2_33: f64 = 1.0 / 8_589_934_592.0;
const P2_43: f64 = 1.0 / 8_796_093_022_208.0;
const P2_55: f64 = 1.0 / 36_028_797_018_963_968.0;

/// CRC-24Q generator polynomial
const CRC24Q_POLY: u32 = 0x0186_4cfb;

/// 1004: header and per satellite block sizes (bits)
const GPS_OBS_HEADER_BITS: usize = 64;
const GPS_OBS_SAT_BITS: usize = 125;

/// 1019 size (bits)
const GPS_EPH_BITS: usize = 488;

/// Invalid phase range marker (20 bit)
const INVALID_PHASE_RANGE: i32 = -524_288;

/// Invalid L2-L1 pseudo range difference marker (14 bit)
const INVALID_PR_DIFF: i32 = -8192;

/// CRC-24Q, as used by RTCM 3 (and SBAS)
pub(crate) fn crc24q(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
        }
    }
    crc & 0x00ff_ffff
}

#[derive(Debug, Default)]
pub(crate) struct Rtcm3 {
    /// Observation epoch being assembled (multiple message epoch)
    pending: Option<ObservationEpoch>,
    /// Issue of data of the last ephemeris forwarded, per satellite
    forwarded: std::collections::HashMap<SV, (u32, f64)>,
}

impl Rtcm3 {
    pub const PREAMBLE: u8 = 0xd3;

    /// preamble + 6 reserved bits + 10 bit length
    pub const HEADER_LEN: usize = 3;

    pub fn frame_len(header: &[u8]) -> Option<usize> {
        if header[0] != Self::PREAMBLE {
            return None;
        }
        let len = getbitu(header, 14, 10) as usize;
        Some(Self::HEADER_LEN + len + 3)
    }

    pub fn checksum_ok(frame: &[u8]) -> bool {
        let end = frame.len() - 3;
        crc24q(&frame[..end]) == getbitu(frame, end * 8, 24)
    }

    pub fn decode(&mut self, frame: &[u8], ctx: &mut Context, out: &mut Vec<Message>) {
        let payload = &frame[Self::HEADER_LEN..frame.len() - 3];
        if payload.len() < 2 {
            return;
        }

        let msg_type = getbitu(payload, 0, 12);

        match msg_type {
            1004 => self.decode_1004(payload, ctx, out),
            1019 => {
                if let Some(ephemeris) = self.decode_1019(payload, ctx) {
                    out.push(Message::Ephemeris(ephemeris));
                }
            },
            1005 | 1006 => {
                if let Some(position) = decode_station(msg_type, payload) {
                    debug!("{} - station position {:?}", ctx.role, position);
                    out.push(Message::StationPosition(position));
                }
            },
            _ => {
                trace!("{} - ignored RTCM {}", ctx.role, msg_type);
            },
        }
    }

    fn flush(&mut self, out: &mut Vec<Message>) {
        if let Some(epoch) = self.pending.take() {
            out.push(Message::Observation(epoch));
        }
    }

    fn decode_1004(&mut self, payload: &[u8], ctx: &mut Context, out: &mut Vec<Message>) {
        if payload.len() * 8 < GPS_OBS_HEADER_BITS {
            debug!("{} - RTCM 1004 too short", ctx.role);
            return;
        }

        let tow_ms = getbitu(payload, 24, 30);
        let sync = getbitu(payload, 54, 1);
        let nsat = getbitu(payload, 55, 5) as usize;

        if payload.len() * 8 < GPS_OBS_HEADER_BITS + nsat * GPS_OBS_SAT_BITS {
            debug!("{} - RTCM 1004 truncated ({} sat)", ctx.role, nsat);
            return;
        }

        let t = resolve_tow(tow_ms as f64 * 1.0E-3, ctx.time);
        ctx.time = t;

        if self.pending.as_ref().is_some_and(|epoch| epoch.epoch != t) {
            // next epoch started before the previous one was closed
            self.flush(out);
        }

        let epoch = self
            .pending
            .get_or_insert_with(|| ObservationEpoch::new(ctx.role, t));

        let (lambda1, lambda2) = (Carrier::L1.wavelength_m(), Carrier::L2.wavelength_m());

        let mut i = GPS_OBS_HEADER_BITS;

        for _ in 0..nsat {
            let prn = getbitu(payload, i, 6) as u8;
            i += 6 + 1;
            let pr1 = getbitu(payload, i, 24) as f64;
            i += 24;
            let ppr1 = getbits(payload, i, 20);
            i += 20 + 7;
            let amb = getbitu(payload, i, 8) as f64;
            i += 8;
            let cnr1 = getbitu(payload, i, 8) as f64 * 0.25;
            i += 8 + 2;
            let pr21 = getbits(payload, i, 14);
            i += 14;
            let ppr2 = getbits(payload, i, 20);
            i += 20 + 7;
            let cnr2 = getbitu(payload, i, 8) as f64 * 0.25;
            i += 8;

            if prn == 0 || prn > 32 {
                continue;
            }

            let sv = SV::new(Constellation::GPS, prn);
            let pr1 = pr1 * 0.02 + amb * PRUNIT_GPS;

            let mut cp1 = if ppr1 != INVALID_PHASE_RANGE {
                Some((pr1 + ppr1 as f64 * 0.0005) / lambda1)
            } else {
                None
            };

            let mut cp2 = if ppr2 != INVALID_PHASE_RANGE {
                Some((pr1 + ppr2 as f64 * 0.0005) / lambda2)
            } else {
                None
            };

            if ctx.options.invert_carrier_phase {
                cp1 = cp1.map(|cp| -cp);
                cp2 = cp2.map(|cp| -cp);
            }

            epoch.measurements.push(Measurement {
                sv,
                carrier: Carrier::L1,
                pseudo_range_m: Some(pr1),
                carrier_phase_cycles: cp1,
                doppler_hz: None,
                cn0_dbhz: cnr1,
            });

            if pr21 != INVALID_PR_DIFF {
                epoch.measurements.push(Measurement {
                    sv,
                    carrier: Carrier::L2,
                    pseudo_range_m: Some(pr1 + pr21 as f64 * 0.02),
                    carrier_phase_cycles: cp2,
                    doppler_hz: None,
                    cn0_dbhz: cnr2,
                });
            }
        }

        if sync == 0 {
            self.flush(out);
        }
    }

    fn decode_1019(&mut self, payload: &[u8], ctx: &Context) -> Option<Ephemeris> {
        if payload.len() * 8 < GPS_EPH_BITS {
            debug!("{} - RTCM 1019 too short", ctx.role);
            return None;
        }

        let mut i = 12;

        let prn = getbitu(payload, i, 6) as u8;
        i += 6;
        let week = getbitu(payload, i, 10);
        i += 10 + 4 + 2;
        let idot = getbits(payload, i, 14) as f64 * P2_43 * SC2RAD;
        i += 14;
        let iode = getbitu(payload, i, 8);
        i += 8;
        let toc_s = getbitu(payload, i, 16) as f64 * 16.0;
        i += 16;
        let af2 = getbits(payload, i, 8) as f64 * P2_55;
        i += 8;
        let af1 = getbits(payload, i, 16) as f64 * P2_43;
        i += 16;
        let af0 = getbits(payload, i, 22) as f64 * P2_31;
        i += 22;
        let iodc = getbitu(payload, i, 10);
        i += 10;
        let crs = getbits(payload, i, 16) as f64 * P2_5;
        i += 16;
        let delta_n = getbits(payload, i, 16) as f64 * P2_43 * SC2RAD;
        i += 16;
        let m0 = getbits(payload, i, 32) as f64 * P2_31 * SC2RAD;
        i += 32;
        let cuc = getbits(payload, i, 16) as f64 * P2_29;
        i += 16;
        let e = getbitu(payload, i, 32) as f64 * P2_33;
        i += 32;
        let cus = getbits(payload, i, 16) as f64 * P2_29;
        i += 16;
        let sqrt_a = getbitu(payload, i, 32) as f64 * P2_19;
        i += 32;
        let toe_s = getbitu(payload, i, 16) as f64 * 16.0;
        i += 16;
        let cic = getbits(payload, i, 16) as f64 * P2_29;
        i += 16;
        let omega0 = getbits(payload, i, 32) as f64 * P2_31 * SC2RAD;
        i += 32;
        let cis = getbits(payload, i, 16) as f64 * P2_29;
        i += 16;
        let i0 = getbits(payload, i, 32) as f64 * P2_31 * SC2RAD;
        i += 32;
        let crc = getbits(payload, i, 16) as f64 * P2_5;
        i += 16;
        let omega = getbits(payload, i, 32) as f64 * P2_31 * SC2RAD;
        i += 32;
        let omega_dot = getbits(payload, i, 24) as f64 * P2_43 * SC2RAD;
        i += 24;
        let tgd = getbits(payload, i, 8) as f64 * P2_31;
        i += 8;
        let health = getbitu(payload, i, 6);
        i += 6 + 1;
        let fit = getbitu(payload, i, 1);

        if prn == 0 || prn > 32 {
            return None;
        }

        let sv = SV::new(Constellation::GPS, prn);
        let (reference_week, _) = gpst_week_tow(ctx.time);

        let ephemeris = Ephemeris {
            sv,
            week: resolve_week(week, reference_week),
            toe_s,
            toc_s,
            iode,
            iodc,
            health,
            fit_interval_h: if fit == 0 { 4.0 } else { 6.0 },
            sqrt_a,
            e,
            i0,
            omega0,
            omega,
            m0,
            delta_n,
            idot,
            omega_dot,
            cuc,
            cus,
            crc,
            crs,
            cic,
            cis,
            af0,
            af1,
            af2,
            tgd,
        };

        let issue = (iode, toe_s);
        if !ctx.options.all_ephemerides && self.forwarded.get(&sv) == Some(&issue) {
            return None;
        }

        self.forwarded.insert(sv, issue);
        Some(ephemeris)
    }
}

/// Decodes 1005/1006 antenna reference point (ECEF m)
fn decode_station(msg_type: u32, payload: &[u8]) -> Option<Vector3<f64>> {
    let min_bits = if msg_type == 1006 { 168 } else { 152 };
    if payload.len() * 8 < min_bits {
        return None;
    }

    let mut i = 12 + 12 + 6 + 4;
    let x = getbits_38(payload, i);
    i += 38 + 2;
    let y = getbits_38(payload, i);
    i += 38 + 2;
    let z = getbits_38(payload, i);

    Some(Vector3::new(x, y, z) * 1.0E-4)
}
