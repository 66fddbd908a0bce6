//! I/O streams: eight slots (3 inputs, 2 solution outputs, 3 logs),
//! operated cooperatively by the processing thread.
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

mod interface;
mod ntrip;

pub use interface::Interface;
pub use ntrip::NtripTarget;

use crate::{
    observation::ReceiverRole,
    settings::{StreamSettings, StreamType},
    status::{StreamState, StreamStatus},
};

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {0:?} path \"{1}\"")]
    InvalidPath(StreamType, String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("ntrip caster: {0}")]
    Ntrip(String),
    #[error("{0} is not open")]
    NotOpen(StreamRole),
    #[error("streams can't be reconfigured while open")]
    InvalidState,
}

/// Stream slot, by function
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamRole {
    RoverIn,
    BaseIn,
    CorrectionIn,
    SolutionOut1,
    SolutionOut2,
    LogRover,
    LogBase,
    LogCorrection,
}

impl StreamRole {
    /// All slots, in opening order
    pub const ALL: [Self; 8] = [
        Self::RoverIn,
        Self::BaseIn,
        Self::CorrectionIn,
        Self::SolutionOut1,
        Self::SolutionOut2,
        Self::LogRover,
        Self::LogBase,
        Self::LogCorrection,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::RoverIn => 0,
            Self::BaseIn => 1,
            Self::CorrectionIn => 2,
            Self::SolutionOut1 => 3,
            Self::SolutionOut2 => 4,
            Self::LogRover => 5,
            Self::LogBase => 6,
            Self::LogCorrection => 7,
        }
    }

    pub fn is_input(&self) -> bool {
        self.receiver().is_some()
    }

    /// [ReceiverRole] feeding this input slot
    pub fn receiver(&self) -> Option<ReceiverRole> {
        match self {
            Self::RoverIn => Some(ReceiverRole::Rover),
            Self::BaseIn => Some(ReceiverRole::Base),
            Self::CorrectionIn => Some(ReceiverRole::Correction),
            _ => None,
        }
    }

    /// Input slot of this receiver
    pub fn input(role: ReceiverRole) -> Self {
        match role {
            ReceiverRole::Rover => Self::RoverIn,
            ReceiverRole::Base => Self::BaseIn,
            ReceiverRole::Correction => Self::CorrectionIn,
        }
    }

    /// Log slot of this receiver
    pub fn log(role: ReceiverRole) -> Self {
        match role {
            ReceiverRole::Rover => Self::LogRover,
            ReceiverRole::Base => Self::LogBase,
            ReceiverRole::Correction => Self::LogCorrection,
        }
    }
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoverIn => write!(f, "rover-in"),
            Self::BaseIn => write!(f, "base-in"),
            Self::CorrectionIn => write!(f, "correction-in"),
            Self::SolutionOut1 => write!(f, "solution-1"),
            Self::SolutionOut2 => write!(f, "solution-2"),
            Self::LogRover => write!(f, "log-rover"),
            Self::LogBase => write!(f, "log-base"),
            Self::LogCorrection => write!(f, "log-correction"),
        }
    }
}

/// Parsed stream path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `port[:baud]`
    Serial { port: String, baud: u32 },
    /// `host:port`
    TcpClient(String),
    /// `[addr]:port`
    TcpServer(String),
    /// `[user[:passwd]@]host[:port]/mountpoint`
    Ntrip(NtripTarget),
    /// File path
    File(String),
}

impl Endpoint {
    /// Parses the path of a stream of this [StreamType].
    /// Returns None for [StreamType::None].
    pub fn parse(stream_type: StreamType, path: &str) -> Result<Option<Self>, Error> {
        let invalid = || Error::InvalidPath(stream_type, path.to_string());
        let path = path.trim();

        let endpoint = match stream_type {
            StreamType::None => return Ok(None),
            StreamType::Serial => {
                let (port, baud) = match path.rsplit_once(':') {
                    Some((port, baud)) => (port, baud.parse::<u32>().map_err(|_| invalid())?),
                    None => (path, DEFAULT_BAUD_RATE),
                };

                if port.is_empty() {
                    return Err(invalid());
                }

                Self::Serial {
                    port: port.to_string(),
                    baud,
                }
            },
            StreamType::TcpClient => {
                let (host, port) = path.rsplit_once(':').ok_or_else(invalid)?;
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(invalid());
                }
                Self::TcpClient(path.to_string())
            },
            StreamType::TcpServer => {
                let (addr, port) = path.rsplit_once(':').ok_or_else(invalid)?;
                if port.parse::<u16>().is_err() {
                    return Err(invalid());
                }
                let addr = if addr.is_empty() { "0.0.0.0" } else { addr };
                Self::TcpServer(format!("{}:{}", addr, port))
            },
            StreamType::Ntrip => Self::Ntrip(NtripTarget::parse(path).ok_or_else(invalid)?),
            StreamType::File => {
                if path.is_empty() {
                    return Err(invalid());
                }
                Self::File(path.to_string())
            },
        };

        Ok(Some(endpoint))
    }
}

/// Outcome of a non-blocking read
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// Number of bytes read
    Data(usize),
    /// End of stream
    Eof,
    /// Nothing available right now
    WouldBlock,
}

/// One stream slot
struct Slot {
    role: StreamRole,
    stream_type: StreamType,
    endpoint: Option<Endpoint>,
    interface: Option<Interface>,
    state: StreamState,
    /// Total bytes exchanged since opening
    bytes: u64,
    /// Bytes exchanged in the current cycle
    cycle_bytes: u64,
    bitrate_bps: f64,
    /// Last error or event
    message: String,
    /// Last (re)connection attempt
    last_attempt: Option<Instant>,
}

impl Slot {
    fn new(role: StreamRole) -> Self {
        Self {
            role,
            stream_type: StreamType::None,
            endpoint: None,
            interface: None,
            state: StreamState::Closed,
            bytes: 0,
            cycle_bytes: 0,
            bitrate_bps: 0.0,
            message: String::new(),
            last_attempt: None,
        }
    }

    fn open(&mut self) -> Result<(), Error> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };

        self.last_attempt = Some(Instant::now());

        let interface = Interface::open(endpoint, self.role.is_input())?;

        if let Some(addr) = interface.local_addr() {
            self.message = format!("listening on {}", addr);
        } else {
            self.message.clear();
        }

        self.interface = Some(interface);
        self.state = StreamState::Waiting;
        self.cycle_bytes = 0;
        self.bitrate_bps = 0.0;

        debug!("{} - opened ({:?})", self.role, self.stream_type);
        Ok(())
    }

    /// Releases the interface, keeping the failure visible
    fn fail(&mut self, e: &Error) {
        warn!("{} - {}", self.role, e);

        if let Some(interface) = self.interface.take() {
            let _ = interface.close();
        }

        self.state = StreamState::Error;
        self.message = e.to_string();
        self.bitrate_bps = 0.0;
    }

    fn close(&mut self) {
        if let Some(interface) = self.interface.take() {
            if let Err(e) = interface.close() {
                error!("{} - failed to close: {}", self.role, e);
            }
        }
        self.state = StreamState::Closed;
        self.bitrate_bps = 0.0;
        self.cycle_bytes = 0;
    }
}

/// Owns the eight stream slots
pub struct StreamManager {
    slots: [Slot; 8],
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|i| Slot::new(StreamRole::ALL[i])),
        }
    }

    fn slot(&self, role: StreamRole) -> &Slot {
        &self.slots[role.index()]
    }

    fn slot_mut(&mut self, role: StreamRole) -> &mut Slot {
        &mut self.slots[role.index()]
    }

    /// True when at least one slot holds an open interface
    pub fn any_open(&self) -> bool {
        self.slots.iter().any(|slot| slot.interface.is_some())
    }

    /// Configures all slots. Only allowed while all of them are closed.
    pub fn configure(&mut self, streams: &[StreamSettings; 8]) -> Result<(), Error> {
        if self.any_open() {
            return Err(Error::InvalidState);
        }

        let mut endpoints = Vec::with_capacity(8);
        for stream in streams.iter() {
            endpoints.push(Endpoint::parse(stream.stream_type, &stream.path)?);
        }

        for ((slot, stream), endpoint) in self.slots.iter_mut().zip(streams.iter()).zip(endpoints) {
            slot.stream_type = stream.stream_type;
            slot.endpoint = endpoint;
            slot.state = StreamState::Closed;
            slot.bytes = 0;
            slot.message.clear();
            slot.last_attempt = None;
        }

        Ok(())
    }

    /// Opens all configured slots, in [StreamRole] order.
    /// A rover failure aborts and closes everything: other failures are reported
    /// in the slot status, the slot being retried later when it is a network client.
    pub fn open_all(&mut self) -> Result<(), Error> {
        for role in StreamRole::ALL {
            let slot = self.slot_mut(role);

            if slot.endpoint.is_none() {
                continue;
            }

            slot.bytes = 0;

            if let Err(e) = slot.open() {
                if role == StreamRole::RoverIn {
                    error!("{} - failed to open: {}", role, e);
                    self.close_all();
                    return Err(e);
                }

                slot.fail(&e);
            }
        }

        Ok(())
    }

    /// Closes all slots. Idempotent.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.close();
        }
    }

    pub fn is_open(&self, role: StreamRole) -> bool {
        self.slot(role).interface.is_some()
    }

    pub fn state(&self, role: StreamRole) -> StreamState {
        self.slot(role).state
    }

    /// Marks this open slot as [StreamState::Active]
    pub fn set_active(&mut self, role: StreamRole) {
        let slot = self.slot_mut(role);
        if slot.interface.is_some() && slot.state == StreamState::Waiting {
            info!("{} - active", role);
            slot.state = StreamState::Active;
        }
    }

    /// Non-blocking read. I/O failures put the slot in error
    /// and are reported as [Poll::Eof].
    pub fn poll_bytes(&mut self, role: StreamRole, buf: &mut [u8]) -> Poll {
        let slot = self.slot_mut(role);

        let Some(interface) = &mut slot.interface else {
            return Poll::Eof;
        };

        let polled = interface.poll(buf);
        let has_clients = interface.has_clients();

        match polled {
            Ok(Poll::Data(size)) => {
                slot.bytes += size as u64;
                slot.cycle_bytes += size as u64;
                Poll::Data(size)
            },
            Ok(Poll::Eof) => {
                if slot.stream_type.is_network_client() {
                    let e = Error::Io(std::io::ErrorKind::UnexpectedEof.into());
                    slot.fail(&e);
                }
                Poll::Eof
            },
            Ok(Poll::WouldBlock) => {
                if has_clients && !role.is_input() {
                    slot.state = slot.state.max(StreamState::Active);
                }
                Poll::WouldBlock
            },
            Err(e) => {
                slot.fail(&e);
                Poll::Eof
            },
        }
    }

    /// Writes to this slot. Output slots become active on first write.
    pub fn write(&mut self, role: StreamRole, data: &[u8]) -> Result<usize, Error> {
        let slot = self.slot_mut(role);

        let Some(interface) = &mut slot.interface else {
            return Err(Error::NotOpen(role));
        };

        match interface.write(data) {
            Ok(size) => {
                slot.bytes += size as u64;
                slot.cycle_bytes += size as u64;

                if !role.is_input() && (size > 0 || interface.has_clients()) {
                    slot.state = slot.state.max(StreamState::Active);
                }

                Ok(size)
            },
            Err(e) => {
                slot.fail(&e);
                Err(e)
            },
        }
    }

    /// Reopens serial ports and network clients in error, at most once per `period`.
    /// Returns the slots that were reopened.
    pub fn reconnect(&mut self, period: Duration) -> Vec<StreamRole> {
        let mut reopened = Vec::new();

        for slot in self.slots.iter_mut() {
            if slot.state != StreamState::Error || !slot.stream_type.is_reconnected() {
                continue;
            }

            if slot
                .last_attempt
                .is_some_and(|attempt| attempt.elapsed() < period)
            {
                continue;
            }

            match slot.open() {
                Ok(_) => {
                    info!("{} - reconnected", slot.role);
                    reopened.push(slot.role);
                },
                Err(e) => {
                    slot.last_attempt = Some(Instant::now());
                    slot.message = e.to_string();
                    debug!("{} - reconnection failed: {}", slot.role, e);
                },
            }
        }

        reopened
    }

    /// Closes the cycle: updates bitrates over the elapsed period.
    pub fn end_cycle(&mut self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();

        for slot in self.slots.iter_mut() {
            if seconds > 0.0 {
                slot.bitrate_bps = slot.cycle_bytes as f64 * 8.0 / seconds;
            }
            slot.cycle_bytes = 0;
        }
    }

    /// Snapshot of all slots
    pub fn status(&self) -> Vec<StreamStatus> {
        self.slots
            .iter()
            .map(|slot| StreamStatus {
                role: slot.role,
                stream_type: slot.stream_type,
                state: slot.state,
                bytes: slot.bytes,
                bitrate_bps: slot.bitrate_bps,
                message: slot.message.clone(),
            })
            .collect()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
