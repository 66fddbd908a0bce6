use gnss::prelude::SV;
use hifitime::Epoch;

/// Receiver feeding one of the three input streams.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReceiverRole {
    /// Receiver to be positioned
    Rover,
    /// Reference station
    Base,
    /// Correction provider, which is also the ephemeris source
    Correction,
}

impl ReceiverRole {
    pub const ALL: [Self; 3] = [Self::Rover, Self::Base, Self::Correction];

    /// Index in receiver indexed tables
    pub fn index(&self) -> usize {
        match self {
            Self::Rover => 0,
            Self::Base => 1,
            Self::Correction => 2,
        }
    }
}

impl std::fmt::Display for ReceiverRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rover => write!(f, "rover"),
            Self::Base => write!(f, "base"),
            Self::Correction => write!(f, "correction"),
        }
    }
}

/// GPS carrier signals we know how to handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Carrier {
    L1,
    L2,
}

impl Carrier {
    /// Carrier frequency in Hz
    pub fn frequency_hz(&self) -> f64 {
        match self {
            Self::L1 => 1_575.42E6,
            Self::L2 => 1_227.60E6,
        }
    }

    /// Carrier wavelength in meters
    pub fn wavelength_m(&self) -> f64 {
        crate::constants::SPEED_OF_LIGHT_M_S / self.frequency_hz()
    }
}

/// Signal measurement, for one [SV] on one [Carrier]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub sv: SV,
    pub carrier: Carrier,
    /// Pseudo range (m)
    pub pseudo_range_m: Option<f64>,
    /// Carrier phase (cycles)
    pub carrier_phase_cycles: Option<f64>,
    /// Doppler shift (Hz)
    pub doppler_hz: Option<f64>,
    /// Carrier to noise density ratio (dB.Hz)
    pub cn0_dbhz: f64,
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({:?}) pr={:.7E} cp={:.7E} dop={:.7E} cno={}",
            self.sv,
            self.carrier,
            self.pseudo_range_m.unwrap_or_default(),
            self.carrier_phase_cycles.unwrap_or_default(),
            self.doppler_hz.unwrap_or_default(),
            self.cn0_dbhz,
        )
    }
}

/// One time-stamped batch of measurements, from one receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationEpoch {
    /// [ReceiverRole] that produced this epoch
    pub role: ReceiverRole,
    /// Sampling [Epoch], in GPST
    pub epoch: Epoch,
    /// All [Measurement]s
    pub measurements: Vec<Measurement>,
}

impl ObservationEpoch {
    pub fn new(role: ReceiverRole, epoch: Epoch) -> Self {
        Self {
            role,
            epoch,
            measurements: Vec::with_capacity(32),
        }
    }

    /// Returns L1 pseudo range for this [SV], if sampled.
    pub fn l1_pseudo_range(&self, sv: SV) -> Option<f64> {
        self.measurements
            .iter()
            .filter(|m| m.sv == sv && m.carrier == Carrier::L1)
            .find_map(|m| m.pseudo_range_m)
    }

    /// Iterates over L1 measurements that carry a pseudo range.
    pub fn l1_code_measurements(&self) -> impl Iterator<Item = &Measurement> {
        self.measurements
            .iter()
            .filter(|m| m.carrier == Carrier::L1 && m.pseudo_range_m.is_some())
    }
}
