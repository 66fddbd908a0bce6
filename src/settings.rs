//! Server configuration.
//!
//! [Settings] are (de)serialized as JSON. A validated copy is swapped into
//! the server while it is closed, and remains immutable until it is stopped.
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    observation::ReceiverRole,
    stream::{Endpoint, StreamRole},
};

/// [Settings] errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("cycle period must be > 0")]
    NullCycle,
    #[error("buffer size must be > 0")]
    NullBufferSize,
    #[error("solution buffer size must be > 0")]
    NullSolutionBufferSize,
    #[error("rover input stream is not configured")]
    MissingRover,
    #[error("{0}: ntrip can only be used as input")]
    NtripOutput(StreamRole),
    #[error("{0}: {1}")]
    InvalidPath(StreamRole, crate::stream::Error),
    #[error("at least 4 satellites are required to solve")]
    MinSatellites,
    #[error("elevation mask must lie within [0, 90[ degrees")]
    ElevationMask,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type of I/O stream
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    #[default]
    None,
    Serial,
    TcpClient,
    TcpServer,
    Ntrip,
    File,
}

impl StreamType {
    /// Network client streams, for which end of stream is a failure
    pub fn is_network_client(&self) -> bool {
        matches!(self, Self::TcpClient | Self::Ntrip)
    }

    /// Streams reopened after a failure. Files are not: reopening
    /// would replay an input or truncate an output.
    pub fn is_reconnected(&self) -> bool {
        self.is_network_client() || *self == Self::Serial
    }
}

/// Input data format
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFormat {
    /// RTCM 3
    #[default]
    Rtcm3,
    /// U-Blox binary protocol
    Ubx,
}

/// Settings of one stream slot
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    #[serde(rename = "type")]
    pub stream_type: StreamType,

    /// Path or address, syntax depends on [StreamType]
    pub path: String,

    /// Input format (input streams only)
    pub format: StreamFormat,

    /// Startup commands, sent when the stream is opened (input streams only)
    pub commands: String,

    /// Options passed to the decoder (input streams only)
    pub receiver_option: String,
}

impl StreamSettings {
    pub fn is_configured(&self) -> bool {
        self.stream_type != StreamType::None
    }
}

/// Selects which receiver(s) may update the ephemeris store
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavSelect {
    #[default]
    All,
    RoverOnly,
    BaseOnly,
    CorrectionOnly,
}

impl NavSelect {
    pub fn accepts(&self, role: ReceiverRole) -> bool {
        match self {
            Self::All => true,
            Self::RoverOnly => role == ReceiverRole::Rover,
            Self::BaseOnly => role == ReceiverRole::Base,
            Self::CorrectionOnly => role == ReceiverRole::Correction,
        }
    }
}

/// Content of the NMEA sentences sent toward the base stream
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NmeaRequestKind {
    #[default]
    None,
    /// Fixed position, see [NmeaRequest::position_ecef_m]
    BasePos,
    /// Latest rover solution
    SingleSolution,
}

/// Periodic NMEA GGA requests, required by some (virtual reference) casters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmeaRequest {
    /// Request period (ms), 0 disables the request
    pub cycle_ms: u64,
    pub kind: NmeaRequestKind,
    /// Transmitted position, when [NmeaRequestKind::BasePos]
    pub position_ecef_m: [f64; 3],
}

impl Default for NmeaRequest {
    fn default() -> Self {
        Self {
            cycle_ms: 10_000,
            kind: NmeaRequestKind::None,
            position_ecef_m: [0.0; 3],
        }
    }
}

/// Positioning mode
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositioningMode {
    /// Single point positioning, rover only
    Single,
    /// Code differential positioning, using the base station
    #[default]
    Dgps,
}

/// Origin of the base station position
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum BasePosition {
    /// Position received from the base (or correction) stream (RTCM 1005/1006)
    #[default]
    FromStream,
    /// Fixed ECEF coordinates (m)
    Fixed([f64; 3]),
}

/// Options of the positioning core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub mode: PositioningMode,

    /// Satellites below this elevation are excluded
    pub elevation_mask_deg: f64,

    /// Minimal number of satellites to solve
    pub min_satellites: usize,

    /// Solutions with a larger GDOP are rejected
    pub max_gdop: f64,

    /// Least squares iterations
    pub max_iterations: usize,

    /// Saastamoinen troposphere model
    pub troposphere: bool,

    /// Max. rover/base epoch misalignment (ms)
    pub base_tolerance_ms: u64,

    /// How long a rover epoch may wait for its base epoch (ms)
    pub base_timeout_ms: u64,

    /// Ephemeris validity window around toe (s)
    pub max_ephemeris_age_s: f64,

    pub base_position: BasePosition,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            mode: PositioningMode::default(),
            elevation_mask_deg: 10.0,
            min_satellites: 4,
            max_gdop: 30.0,
            max_iterations: 10,
            troposphere: true,
            base_tolerance_ms: 500,
            base_timeout_ms: 2_000,
            max_ephemeris_age_s: 7_200.0,
            base_position: BasePosition::default(),
        }
    }
}

/// Solution output format
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolutionFormat {
    /// Latitude (ddeg), longitude (ddeg), ellipsoidal height (m)
    #[default]
    Llh,
    /// ECEF coordinates (m)
    Xyz,
    /// NMEA GGA sentences
    Nmea,
    /// One JSON object per line
    Json,
}

/// Solution time format
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    /// GPS week and time of week
    #[default]
    GpsWeekTow,
    /// Calendar date and time (GPST)
    Calendar,
}

/// Options of one solution output stream
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolutionOutputOptions {
    pub format: SolutionFormat,
    pub time: TimeFormat,
    /// Emit a header line when the stream is opened
    pub header: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Processing cycle period (ms)
    pub cycle_ms: u64,

    /// Input buffer size (bytes), per input stream
    pub buffer_size: usize,

    /// Number of solutions kept in memory
    pub solution_buffer_size: usize,

    /// Network clients reconnection period (ms)
    pub reconnect_ms: u64,

    /// Stream slots, indexed by [StreamRole]
    pub streams: [StreamSettings; 8],

    pub nav_select: NavSelect,

    pub nmea_request: NmeaRequest,

    pub processing: ProcessingOptions,

    /// Options of [StreamRole::SolutionOut1] and [StreamRole::SolutionOut2]
    pub solution_outputs: [SolutionOutputOptions; 2],
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle_ms: 10,
            buffer_size: 32_768,
            solution_buffer_size: 1_000,
            reconnect_ms: 10_000,
            streams: Default::default(),
            nav_select: NavSelect::default(),
            nmea_request: NmeaRequest::default(),
            processing: ProcessingOptions::default(),
            solution_outputs: Default::default(),
        }
    }
}

impl Settings {
    /// Loads [Settings] from a JSON file. Missing fields take default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Dumps [Settings] as pretty JSON
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn stream(&self, role: StreamRole) -> &StreamSettings {
        &self.streams[role.index()]
    }

    pub fn stream_mut(&mut self, role: StreamRole) -> &mut StreamSettings {
        &mut self.streams[role.index()]
    }

    /// Verifies these [Settings] may be used to start a server.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cycle_ms == 0 {
            return Err(Error::NullCycle);
        }

        if self.buffer_size == 0 {
            return Err(Error::NullBufferSize);
        }

        if self.solution_buffer_size == 0 {
            return Err(Error::NullSolutionBufferSize);
        }

        if !self.stream(StreamRole::RoverIn).is_configured() {
            return Err(Error::MissingRover);
        }

        for role in StreamRole::ALL {
            let stream = self.stream(role);

            if !stream.is_configured() {
                continue;
            }

            if !role.is_input() && stream.stream_type == StreamType::Ntrip {
                return Err(Error::NtripOutput(role));
            }

            Endpoint::parse(stream.stream_type, &stream.path)
                .map_err(|e| Error::InvalidPath(role, e))?;
        }

        if self.processing.min_satellites < 4 {
            return Err(Error::MinSatellites);
        }

        if !(0.0..90.0).contains(&self.processing.elevation_mask_deg) {
            return Err(Error::ElevationMask);
        }

        Ok(())
    }
}
