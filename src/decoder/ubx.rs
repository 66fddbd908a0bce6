//! U-Blox binary protocol: RXM-RAWX (observations) and RXM-SFRBX (navigation frames)
use std::collections::HashMap;

use gnss::prelude::{Constellation, SV};
use log::{debug, error, trace, warn};

use ublox::{
    Parser, ParserError, UbxPacket,
    rxm_rawx::{RecStatFlags, RxmRawxRef, TrkStatFlags},
    rxm_sfrbx::{RxmSfrbxInterpreted, RxmSfrbxRef},
};

#[cfg(feature = "ubx23")]
type Proto = ublox::proto23::Proto23;

#[cfg(feature = "ubx23")]
use ublox::proto23::PacketRef;

#[cfg(all(feature = "ubx27", not(feature = "ubx23")))]
type Proto = ublox::proto27::Proto27;

#[cfg(all(feature = "ubx27", not(feature = "ubx23")))]
use ublox::proto27::PacketRef;

#[cfg(all(feature = "ubx31", not(any(feature = "ubx23", feature = "ubx27"))))]
type Proto = ublox::proto31::Proto31;

#[cfg(all(feature = "ubx31", not(any(feature = "ubx23", feature = "ubx27"))))]
use ublox::proto31::PacketRef;

#[cfg(all(
    feature = "ubx14",
    not(any(feature = "ubx23", feature = "ubx27", feature = "ubx31"))
))]
type Proto = ublox::proto14::Proto14;

#[cfg(all(
    feature = "ubx14",
    not(any(feature = "ubx23", feature = "ubx27", feature = "ubx31"))
))]
use ublox::proto14::PacketRef;

use crate::{
    decoder::{Context, Message},
    ephemeris::PendingFrame,
    observation::{Carrier, Measurement, ObservationEpoch},
    utils::{SBAS_PRN_OFFSET, gpst_epoch, gpst_week_tow, to_constellation},
};

/// RXM packets we are interested in, whatever the protocol version
enum Rxm<'a> {
    Rawx(RxmRawxRef<'a>),
    Sfrbx(RxmSfrbxRef<'a>),
    Other,
}

impl<'a> From<UbxPacket<'a>> for Rxm<'a> {
    fn from(packet: UbxPacket<'a>) -> Self {
        match packet {
            #[cfg(feature = "ubx23")]
            UbxPacket::Proto23(PacketRef::RxmRawx(pkt)) => Self::Rawx(pkt),
            #[cfg(feature = "ubx23")]
            UbxPacket::Proto23(PacketRef::RxmSfrbx(pkt)) => Self::Sfrbx(pkt),

            #[cfg(all(feature = "ubx27", not(feature = "ubx23")))]
            UbxPacket::Proto27(PacketRef::RxmRawx(pkt)) => Self::Rawx(pkt),
            #[cfg(all(feature = "ubx27", not(feature = "ubx23")))]
            UbxPacket::Proto27(PacketRef::RxmSfrbx(pkt)) => Self::Sfrbx(pkt),

            #[cfg(all(feature = "ubx31", not(any(feature = "ubx23", feature = "ubx27"))))]
            UbxPacket::Proto31(PacketRef::RxmRawx(pkt)) => Self::Rawx(pkt),
            #[cfg(all(feature = "ubx31", not(any(feature = "ubx23", feature = "ubx27"))))]
            UbxPacket::Proto31(PacketRef::RxmSfrbx(pkt)) => Self::Sfrbx(pkt),

            #[cfg(all(
                feature = "ubx14",
                not(any(feature = "ubx23", feature = "ubx27", feature = "ubx31"))
            ))]
            UbxPacket::Proto14(PacketRef::RxmRawx(pkt)) => Self::Rawx(pkt),
            #[cfg(all(
                feature = "ubx14",
                not(any(feature = "ubx23", feature = "ubx27", feature = "ubx31"))
            ))]
            UbxPacket::Proto14(PacketRef::RxmSfrbx(pkt)) => Self::Sfrbx(pkt),

            _ => Self::Other,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Ubx {
    /// Subframes being collected, per satellite
    pending: HashMap<SV, PendingFrame>,
    /// Issue of data of the last ephemeris forwarded, per satellite
    forwarded: HashMap<SV, (u32, f64)>,
}

/// Builds the [SV] from UBX gnssId/svId
fn to_sv(gnss_id: u8, sv_id: u8) -> Option<SV> {
    let constellation = to_constellation(gnss_id)?;
    match constellation {
        Constellation::SBAS => Some(SV::new(constellation, sv_id.checked_sub(SBAS_PRN_OFFSET)?)),
        Constellation::Glonass if sv_id == 255 => None,
        _ => Some(SV::new(constellation, sv_id)),
    }
}

impl Ubx {
    pub const SYNC: [u8; 2] = [0xb5, 0x62];

    /// sync (2) + class + id + length (2)
    pub const HEADER_LEN: usize = 6;

    pub fn frame_len(header: &[u8]) -> Option<usize> {
        if header[..2] != Self::SYNC {
            return None;
        }
        let len = u16::from_le_bytes([header[4], header[5]]) as usize;
        Some(Self::HEADER_LEN + len + 2)
    }

    /// Interprets one complete frame. Returns false when the checksum does not match.
    pub fn decode(&mut self, frame: &[u8], ctx: &mut Context, out: &mut Vec<Message>) -> bool {
        // one frame at a time: nothing may remain buffered in between
        let mut parser = Parser::<Vec<u8>, Proto>::new(Vec::with_capacity(frame.len()));
        let mut it = parser.consume_ubx(frame);

        let packet = match it.next() {
            Some(Ok(packet)) => packet,
            Some(Err(ParserError::InvalidChecksum { expect, got })) => {
                debug!(
                    "{} - UBX checksum error: expecting 0x{:04x}, got 0x{:04x}",
                    ctx.role, expect, got
                );
                return false;
            },
            Some(Err(e)) => {
                debug!("{} - UBX parsing error: {}", ctx.role, e);
                return true;
            },
            None => {
                trace!(
                    "{} - ignored UBX class=0x{:02x} id=0x{:02x}",
                    ctx.role, frame[2], frame[3]
                );
                return true;
            },
        };

        match Rxm::from(packet) {
            Rxm::Rawx(pkt) => {
                if let Some(epoch) = self.decode_rawx(pkt, ctx) {
                    out.push(Message::Observation(epoch));
                }
            },
            Rxm::Sfrbx(pkt) => {
                if let Some(msg) = self.decode_sfrbx(pkt, ctx) {
                    out.push(msg);
                }
            },
            Rxm::Other => {
                trace!(
                    "{} - ignored UBX class=0x{:02x} id=0x{:02x}",
                    ctx.role, frame[2], frame[3]
                );
            },
        }

        true
    }

    fn decode_rawx(&mut self, pkt: RxmRawxRef, ctx: &mut Context) -> Option<ObservationEpoch> {
        let week = pkt.week() as u32;

        if week == 0 {
            trace!("{} - RXM-RAWX without valid time", ctx.role);
            return None;
        }

        let t = gpst_epoch(week, pkt.rcv_tow());
        ctx.time = t;

        if pkt.rec_stat().intersects(RecStatFlags::CLK_RESET) {
            warn!("{}({}) - receiver clock reset", t, ctx.role);
        }

        let mut epoch = ObservationEpoch::new(ctx.role, t);

        for meas in pkt.measurements() {
            let Some(sv) = to_sv(meas.gnss_id(), meas.sv_id()) else {
                continue;
            };

            // sigId from protocol 27 (reserved, so L1C/A, before):
            // GPS L1C/A (0), L2CL (3), L2CM (4)
            let carrier = match meas.reserved2() {
                0 => Carrier::L1,
                3 | 4 if sv.constellation == Constellation::GPS => Carrier::L2,
                _ => continue,
            };

            let trk_stat = meas.trk_stat();
            let pr_valid = trk_stat.contains(TrkStatFlags::PR_VALID);
            let cp_valid = trk_stat.contains(TrkStatFlags::CP_VALID);

            let pr = meas.pr_mes();
            let mut cp = meas.cp_mes();

            if ctx.options.invert_carrier_phase {
                cp = -cp;
            }

            let measurement = Measurement {
                sv,
                carrier,
                pseudo_range_m: if pr_valid && pr != 0.0 { Some(pr) } else { None },
                carrier_phase_cycles: if cp_valid && cp != 0.0 { Some(cp) } else { None },
                doppler_hz: Some(meas.do_mes() as f64),
                cn0_dbhz: meas.cno() as f64,
            };

            trace!("{} - {}", t, measurement);
            epoch.measurements.push(measurement);
        }

        Some(epoch)
    }

    fn decode_sfrbx(&mut self, sfrbx: RxmSfrbxRef, ctx: &mut Context) -> Option<Message> {
        let gnss_id = sfrbx.gnss_id();

        let Some(constellation) = to_constellation(gnss_id) else {
            error!("{} - constellation id error #{}", ctx.role, gnss_id);
            return None;
        };

        // GPS LNAV only
        if constellation != Constellation::GPS {
            trace!("{} - {} navigation frames not handled", ctx.role, constellation);
            return None;
        }

        let sv = SV::new(constellation, sfrbx.sv_id());

        // almanac and other pages are not interpreted
        let RxmSfrbxInterpreted::GpsQzss(frame) = sfrbx.interpret()?;

        trace!("{}({}) - decoded {:?}", ctx.role, sv, frame);

        let pending = self.pending.entry(sv).or_default();
        pending.update(frame);

        let (reference_week, _) = gpst_week_tow(ctx.time);
        let ephemeris = pending.validate(sv, reference_week)?;

        let issue = (ephemeris.iode, ephemeris.toe_s);
        if !ctx.options.all_ephemerides && self.forwarded.get(&sv) == Some(&issue) {
            return None;
        }

        self.forwarded.insert(sv, issue);

        debug!(
            "{}({}) - ephemeris iode={} toe={}",
            ctx.role, sv, ephemeris.iode, ephemeris.toe_s
        );

        Some(Message::Ephemeris(ephemeris))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        decoder::{Decoder, FrameState},
        ephemeris::{
            Ephemeris,
            test::{encode_subframes, test_ephemeris},
        },
        observation::ReceiverRole,
        settings::StreamFormat,
    };

    const CLASS_RXM: u8 = 0x02;
    const ID_RAWX: u8 = 0x15;
    const ID_SFRBX: u8 = 0x13;

    const RAWX_HEADER_LEN: usize = 16;
    const RAWX_MEAS_LEN: usize = 32;

    /// Builds a complete UBX frame
    pub(crate) fn ubx_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
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

    /// Decoded and reference sets must describe the same orbit and clock
    fn assert_same_ephemeris(decoded: &Ephemeris, expected: &Ephemeris) {
        assert_eq!(decoded.sv, expected.sv);
        assert_eq!(decoded.week, expected.week);
        assert_eq!(decoded.toe_s, expected.toe_s);
        assert_eq!(decoded.iode, expected.iode);
        assert_eq!(decoded.health, expected.health);

        let t = expected.toe() + hifitime::Duration::from_seconds(900.0);
        let (a, b) = (decoded.satellite_state(t), expected.satellite_state(t));
        assert!((a.position - b.position).norm() < 1.0E-3);
        assert!((a.clock_bias_s - b.clock_bias_s).abs() < 1.0E-12);
    }

    /// RXM-RAWX payload: (gnssId, svId, sigId, pr, cp, trkStat)
    fn rawx_payload(week: u16, tow_s: f64, meas: &[(u8, u8, u8, f64, f64, u8)]) -> Vec<u8> {
        let mut payload = vec![0u8; RAWX_HEADER_LEN + meas.len() * RAWX_MEAS_LEN];
        payload[0..8].copy_from_slice(&tow_s.to_le_bytes());
        payload[8..10].copy_from_slice(&week.to_le_bytes());
        payload[11] = meas.len() as u8;
        payload[13] = 1;

        for (i, (gnss_id, sv_id, sig_id, pr, cp, trk_stat)) in meas.iter().enumerate() {
            let block = &mut payload[RAWX_HEADER_LEN + i * RAWX_MEAS_LEN..][..RAWX_MEAS_LEN];
            block[0..8].copy_from_slice(&pr.to_le_bytes());
            block[8..16].copy_from_slice(&cp.to_le_bytes());
            block[16..20].copy_from_slice(&(-1250.5f32).to_le_bytes());
            block[20] = *gnss_id;
            block[21] = *sv_id;
            block[22] = *sig_id;
            block[26] = 42;
            block[30] = *trk_stat;
        }

        payload
    }

    /// RXM-SFRBX payload, from a parity stripped subframe
    fn sfrbx_payload(sv_id: u8, subframe: &[u8; 30]) -> Vec<u8> {
        let mut payload = vec![0, sv_id, 0, 0, 10, 0, 2, 0];
        for k in 0..10 {
            let data24 = u32::from_be_bytes([0, subframe[3 * k], subframe[3 * k + 1], subframe[3 * k + 2]]);
            payload.extend_from_slice(&(data24 << 6).to_le_bytes());
        }
        payload
    }

    #[test]
    fn rawx_decoding() {
        let mut decoder = Decoder::new(ReceiverRole::Rover, StreamFormat::Ubx, 4096, "-INVCP");

        let payload = rawx_payload(
            2300,
            345_600.0,
            &[
                (0, 5, 0, 21_000_000.5, 110_000_000.25, 0x03),
                (0, 5, 3, 21_000_003.0, 86_000_000.0, 0x01),
                (0, 12, 0, 22_000_000.0, 0.0, 0x01),
                (1, 131, 0, 38_000_000.0, 0.0, 0x01),
                (6, 255, 0, 20_000_000.0, 0.0, 0x01),
                (2, 4, 0, 0.0, 0.0, 0x00),
            ],
        );

        decoder.push(&ubx_frame(CLASS_RXM, ID_RAWX, &payload));
        let messages = decoder.decode();
        assert_eq!(messages.len(), 1);

        let Message::Observation(epoch) = &messages[0] else {
            panic!("expecting observations");
        };

        assert_eq!(epoch.role, ReceiverRole::Rover);
        assert_eq!(gpst_week_tow(epoch.epoch), (2300, 345_600.0));
        assert_eq!(epoch.measurements.len(), 5, "unknown glonass slot dropped");

        let g05 = SV::new(Constellation::GPS, 5);
        assert_eq!(epoch.l1_pseudo_range(g05), Some(21_000_000.5));

        let first = epoch.measurements[0];
        assert_eq!(first.carrier_phase_cycles, Some(-110_000_000.25));
        assert_eq!(first.cn0_dbhz, 42.0);
        assert_eq!(epoch.measurements[1].carrier, Carrier::L2);

        let sbas = epoch.measurements[3];
        assert_eq!(sbas.sv, SV::new(Constellation::SBAS, 31));

        let untracked = epoch.measurements[4];
        assert!(untracked.pseudo_range_m.is_none());

        assert_eq!(epoch.l1_code_measurements().count(), 3);
    }

    #[test]
    fn sfrbx_decoding() {
        let mut decoder = Decoder::new(ReceiverRole::Correction, StreamFormat::Ubx, 4096, "");
        decoder.set_time_reference(gpst_epoch(2300, 340_000.0));

        let eph = test_ephemeris(7, 2300, 345_600.0);
        let frames = encode_subframes(&eph);

        // repeated transmission: forwarded once
        for _ in 0..2 {
            for frame in frames.iter() {
                decoder.push(&ubx_frame(CLASS_RXM, ID_SFRBX, &sfrbx_payload(7, frame)));
            }
        }

        let messages = decoder.decode();
        assert_eq!(messages.len(), 1);

        let Message::Ephemeris(decoded) = &messages[0] else {
            panic!("expecting ephemeris");
        };

        assert_same_ephemeris(decoded, &eph);
        assert_eq!(decoder.stats().decoded_frames, 6);
        assert_eq!(decoder.state(), FrameState::AwaitSync);
    }

    #[test]
    fn all_ephemerides_option() {
        let mut decoder = Decoder::new(ReceiverRole::Correction, StreamFormat::Ubx, 4096, "-EPHALL");
        decoder.set_time_reference(gpst_epoch(2300, 340_000.0));

        let eph = test_ephemeris(9, 2300, 345_600.0);
        let frames = encode_subframes(&eph);

        for _ in 0..2 {
            for frame in frames.iter() {
                decoder.push(&ubx_frame(CLASS_RXM, ID_SFRBX, &sfrbx_payload(9, frame)));
            }
        }

        // each subframe completes the set once the first three are known
        let messages = decoder.decode();
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn checksum_validation() {
        let mut decoder = Decoder::new(ReceiverRole::Rover, StreamFormat::Ubx, 4096, "");

        let frame = ubx_frame(0x0a, 0x04, &[]);
        assert_eq!(Ubx::frame_len(&frame[..6]), Some(8));

        let mut corrupted = frame.clone();
        corrupted[3] = 0x05;

        decoder.push(&corrupted);
        decoder.push(&frame);
        assert!(decoder.decode().is_empty());

        let stats = decoder.stats();
        assert_eq!(stats.decoded_frames, 1);
        assert_eq!(stats.corrupt_frames, 1);
    }

    #[test]
    fn subframes_from_other_systems_are_ignored() {
        let mut decoder = Decoder::new(ReceiverRole::Rover, StreamFormat::Ubx, 4096, "");

        let eph = test_ephemeris(3, 2300, 345_600.0);
        for frame in encode_subframes(&eph).iter() {
            let mut payload = sfrbx_payload(3, frame);
            payload[0] = 2;
            decoder.push(&ubx_frame(CLASS_RXM, ID_SFRBX, &payload));
        }

        assert!(decoder.decode().is_empty());
        assert_eq!(decoder.stats().decoded_frames, 3);
    }
}
