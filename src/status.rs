//! Point-in-time snapshots, returned by value to polling threads.
use gnss::prelude::SV;
use hifitime::Epoch;
use nalgebra::Vector3;

use crate::{
    observation::ReceiverRole, settings::StreamType, solution::Solution, stream::StreamRole,
};

/// Server lifecycle
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ServerState {
    #[default]
    Closed,
    /// Started, rover data not observed yet
    Waiting,
    /// Rover data is flowing
    Active,
    /// Start failure
    Error,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Stream slot state, ordered by "health"
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Error,
    #[default]
    Closed,
    Waiting,
    Active,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "E"),
            Self::Closed => write!(f, "-"),
            Self::Waiting => write!(f, "W"),
            Self::Active => write!(f, "C"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStatus {
    pub role: StreamRole,
    pub stream_type: StreamType,
    pub state: StreamState,
    /// Bytes exchanged since opening
    pub bytes: u64,
    /// Bitrate over the last cycle
    pub bitrate_bps: f64,
    /// Last error or event
    pub message: String,
}

impl StreamStatus {
    pub fn closed(role: StreamRole) -> Self {
        Self {
            role,
            stream_type: StreamType::None,
            state: StreamState::Closed,
            bytes: 0,
            bitrate_bps: 0.0,
            message: String::new(),
        }
    }
}

/// Status of all stream slots, with a global message
#[derive(Debug, Clone, PartialEq)]
pub struct StreamsStatus {
    pub streams: Vec<StreamStatus>,
    pub message: String,
}

impl StreamsStatus {
    pub fn closed() -> Self {
        Self {
            streams: StreamRole::ALL
                .iter()
                .map(|role| StreamStatus::closed(*role))
                .collect(),
            message: String::new(),
        }
    }

    pub fn get(&self, role: StreamRole) -> Option<&StreamStatus> {
        self.streams.iter().find(|status| status.role == role)
    }

    /// One character per slot (`E`rror, `-` closed, `W`aiting, `C`onnected)
    pub fn summary(&self) -> String {
        self.streams.iter().map(|s| s.state.to_string()).collect()
    }
}

/// Tracking status of one satellite
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SatelliteStatus {
    pub sv: SV,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub cn0_dbhz: f64,
    /// Used in the last solution
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationStatus {
    pub role: ReceiverRole,
    /// Last epoch received
    pub epoch: Option<Epoch>,
    pub satellites: Vec<SatelliteStatus>,
}

impl ObservationStatus {
    pub fn empty(role: ReceiverRole) -> Self {
        Self {
            role,
            epoch: None,
            satellites: Vec::new(),
        }
    }
}

/// Outcome of the processing, updated every cycle
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ControlResult {
    /// Last [Solution]
    pub solution: Option<Solution>,
    /// Base station position in use (ECEF m)
    pub base_position: Option<Vector3<f64>>,
    /// Age of differential corrections (s)
    pub age_s: f64,
    /// Satellites used in the last solution
    pub valid_satellites: usize,
    /// Rover epochs processed
    pub processed_epochs: u64,
    /// Frames decoded, all inputs
    pub decoded_frames: u64,
    /// Frames discarded, all inputs
    pub corrupt_frames: u64,
    /// Bytes dropped on backlog overflow, all inputs
    pub dropped_bytes: u64,
    /// Failed processing cycles
    pub cycle_failures: u64,
    /// Last processing event
    pub message: String,
}
