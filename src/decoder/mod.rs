//! Raw receiver data decoding.
//!
//! Each input stream owns one [Decoder]: a framing state machine
//! (shared by all formats) that buffers partial frames across cycles
//! and hands complete frames to the format specific payload decoder,
//! which validates and interprets them.
use hifitime::Epoch;
use log::{debug, trace, warn};
use nalgebra::Vector3;

pub mod bits;
mod rtcm3;
mod ubx;

use rtcm3::Rtcm3;
use ubx::Ubx;

use crate::{
    ephemeris::Ephemeris,
    observation::{ObservationEpoch, ReceiverRole},
    settings::StreamFormat,
};

/// Decoded content, forwarded to the processing core
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// New [ObservationEpoch]
    Observation(ObservationEpoch),
    /// New [Ephemeris]
    Ephemeris(Ephemeris),
    /// Reference station position (ECEF m)
    StationPosition(Vector3<f64>),
}

/// Framing state
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FrameState {
    /// Looking for the frame preamble
    #[default]
    AwaitSync,
    /// Header is validated, waiting for the complete frame
    AccumulatingPayload,
    /// Frame complete with valid checksum
    Complete,
    /// Frame is not valid and will be discarded
    Corrupt,
}

/// Decoding counters
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames that passed the checksum
    pub decoded_frames: u64,
    /// Frames discarded because of bad header or checksum
    pub corrupt_frames: u64,
    /// Bytes dropped because the backlog exceeded its capacity
    pub dropped_bytes: u64,
    /// [Message]s produced
    pub messages: u64,
}

/// Options passed to a receiver decoder, as a space separated list.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// -INVCP: invert carrier phase polarity
    pub invert_carrier_phase: bool,
    /// -EPHALL: forward all ephemerides, even when unchanged
    pub all_ephemerides: bool,
}

impl ReceiverOptions {
    pub fn parse(options: &str) -> Self {
        let mut parsed = Self::default();

        for opt in options.split_whitespace() {
            match opt {
                "-INVCP" => parsed.invert_carrier_phase = true,
                "-EPHALL" => parsed.all_ephemerides = true,
                unknown => {
                    warn!("unknown receiver option \"{}\"", unknown);
                },
            }
        }

        parsed
    }
}

/// Context shared with payload decoders
#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub role: ReceiverRole,
    pub options: ReceiverOptions,
    /// Latest known time, used to resolve truncated weeks and times of week
    pub time: Epoch,
}

/// Format specific payload decoder
#[derive(Debug)]
enum Protocol {
    Ubx(Ubx),
    Rtcm3(Rtcm3),
}

impl Protocol {
    fn header_len(&self) -> usize {
        match self {
            Self::Ubx(_) => Ubx::HEADER_LEN,
            Self::Rtcm3(_) => Rtcm3::HEADER_LEN,
        }
    }

    fn is_sync_byte(&self, byte: u8) -> bool {
        match self {
            Self::Ubx(_) => byte == Ubx::SYNC[0],
            Self::Rtcm3(_) => byte == Rtcm3::PREAMBLE,
        }
    }

    fn frame_len(&self, header: &[u8]) -> Option<usize> {
        match self {
            Self::Ubx(_) => Ubx::frame_len(header),
            Self::Rtcm3(_) => Rtcm3::frame_len(header),
        }
    }

    /// Validates and interprets one complete frame.
    /// Returns false when the frame checksum does not match.
    fn decode(&mut self, frame: &[u8], ctx: &mut Context, out: &mut Vec<Message>) -> bool {
        match self {
            Self::Ubx(ubx) => ubx.decode(frame, ctx, out),
            Self::Rtcm3(rtcm) => {
                if !Rtcm3::checksum_ok(frame) {
                    return false;
                }
                rtcm.decode(frame, ctx, out);
                true
            },
        }
    }
}

/// Framing state machine of one input stream.
#[derive(Debug)]
pub struct Decoder {
    /// Current [FrameState]
    state: FrameState,
    /// Pending bytes, not consumed yet
    backlog: Vec<u8>,
    /// Backlog capacity (bytes)
    capacity: usize,
    /// Length of the frame being accumulated
    frame_len: usize,
    /// Payload decoder
    protocol: Protocol,
    /// Decoding context
    ctx: Context,
    /// Counters
    stats: DecoderStats,
}

impl Decoder {
    /// Creates a new [Decoder] for this [ReceiverRole].
    /// `capacity` bounds the backlog of undecoded bytes.
    pub fn new(role: ReceiverRole, format: StreamFormat, capacity: usize, options: &str) -> Self {
        let protocol = match format {
            StreamFormat::Ubx => Protocol::Ubx(Ubx::default()),
            StreamFormat::Rtcm3 => Protocol::Rtcm3(Rtcm3::default()),
        };

        let time = Epoch::now().unwrap_or_else(|e| {
            warn!("{} - failed to determine system time: {}", role, e);
            crate::utils::gpst_epoch(0, 0.0)
        });

        Self {
            protocol,
            capacity: capacity.max(1),
            frame_len: 0,
            state: FrameState::default(),
            backlog: Vec::with_capacity(capacity.max(1)),
            stats: DecoderStats::default(),
            ctx: Context {
                role,
                time,
                options: ReceiverOptions::parse(options),
            },
        }
    }

    /// Overrides the time reference, used to resolve truncated time fields.
    pub fn set_time_reference(&mut self, t: Epoch) {
        self.ctx.time = t;
    }

    pub fn role(&self) -> ReceiverRole {
        self.ctx.role
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Number of bytes waiting in the backlog
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    /// Appends new bytes to the backlog. When capacity is exceeded,
    /// oldest bytes are dropped.
    pub fn push(&mut self, data: &[u8]) {
        let data = if data.len() > self.capacity {
            let skipped = data.len() - self.capacity;
            self.stats.dropped_bytes += skipped as u64;
            &data[skipped..]
        } else {
            data
        };

        let total = self.backlog.len() + data.len();

        if total > self.capacity {
            let overflow = total - self.capacity;
            self.backlog.drain(..overflow);
            self.stats.dropped_bytes += overflow as u64;

            warn!(
                "{} - backlog overflow: dropped {} bytes",
                self.ctx.role, overflow
            );

            // partial frame is lost
            self.state = FrameState::AwaitSync;
        }

        self.backlog.extend_from_slice(data);
    }

    /// Runs the state machine over the backlog, returning all [Message]s
    /// that could be decoded. Incomplete frames stay buffered.
    pub fn decode(&mut self) -> Vec<Message> {
        let mut out = Vec::new();

        loop {
            match self.state {
                FrameState::AwaitSync => {
                    let pos = self
                        .backlog
                        .iter()
                        .position(|b| self.protocol.is_sync_byte(*b));

                    match pos {
                        None => {
                            trace!(
                                "{} - discarding {} bytes (no sync)",
                                self.ctx.role,
                                self.backlog.len()
                            );
                            self.backlog.clear();
                            break;
                        },
                        Some(pos) => {
                            self.backlog.drain(..pos);
                        },
                    }

                    let header_len = self.protocol.header_len();
                    if self.backlog.len() < header_len {
                        break;
                    }

                    match self.protocol.frame_len(&self.backlog[..header_len]) {
                        Some(len) if len <= self.capacity => {
                            self.frame_len = len;
                            self.state = FrameState::AccumulatingPayload;
                        },
                        Some(_) => {
                            self.state = FrameState::Corrupt;
                        },
                        None => {
                            // not a real preamble
                            self.backlog.drain(..1);
                        },
                    }
                },
                FrameState::AccumulatingPayload => {
                    if self.backlog.len() < self.frame_len {
                        break;
                    }

                    let before = out.len();

                    let valid = self.protocol.decode(
                        &self.backlog[..self.frame_len],
                        &mut self.ctx,
                        &mut out,
                    );

                    self.stats.messages += (out.len() - before) as u64;

                    if valid {
                        self.state = FrameState::Complete;
                    } else {
                        self.state = FrameState::Corrupt;
                    }
                },
                FrameState::Complete => {
                    self.backlog.drain(..self.frame_len);
                    self.stats.decoded_frames += 1;
                    self.state = FrameState::AwaitSync;
                },
                FrameState::Corrupt => {
                    self.stats.corrupt_frames += 1;

                    debug!(
                        "{} - corrupt frame ({} bytes), resynchronizing",
                        self.ctx.role, self.frame_len
                    );

                    // skip this preamble and look for the next one
                    self.backlog.drain(..1);
                    self.state = FrameState::AwaitSync;
                },
            }
        }

        out
    }
}
