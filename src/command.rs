//! Receiver startup commands.
//!
//! One command per line (`\n`, `\r\n` or `;` separated).
//! Lines starting with `!UBX` are translated to UBX frames:
//! - `!UBX CFG-RATE <measure_ms> [<nav_rate>]`
//! - `!UBX CFG-MSG <RXM-RAWX|RXM-SFRBX> <rate>`
//! - `!UBX MON-VER`
//!
//! Any other line is sent verbatim, CRLF terminated.
use log::{debug, error};
use thiserror::Error;

use ublox::{
    UbxPacketRequest,
    cfg_msg::CfgMsgAllPortsBuilder,
    cfg_rate::{AlignmentToReferenceTime, CfgRateBuilder},
    mon_ver::MonVer,
    rxm_rawx::RxmRawx,
    rxm_sfrbx::RxmSfrbx,
};

const UBX_PREFIX: &str = "!UBX";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("unknown UBX command: {0}")]
    UnknownUbx(String),
    #[error("unknown UBX message: {0}")]
    UnknownMessage(String),
    #[error("invalid argument \"{0}\"")]
    InvalidArgument(String),
    #[error("missing argument in \"{0}\"")]
    MissingArgument(String),
}

/// Messages that may be enabled with `CFG-MSG`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UbxMessage {
    RxmRawx,
    RxmSfrbx,
}

impl std::str::FromStr for UbxMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RXM-RAWX" => Ok(Self::RxmRawx),
            "RXM-SFRBX" => Ok(Self::RxmSfrbx),
            _ => Err(Error::UnknownMessage(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Text sent as is
    Text(String),
    /// UBX-CFG-RATE
    CfgRate { measure_rate_ms: u16, nav_rate: u16 },
    /// UBX-CFG-MSG (all ports)
    CfgMsg { message: UbxMessage, rate: u8 },
    /// UBX-MON-VER poll request
    MonVer,
}

fn parse_arg<T: std::str::FromStr>(arg: Option<&str>, line: &str) -> Result<T, Error> {
    let arg = arg.ok_or(Error::MissingArgument(line.to_string()))?;
    arg.parse::<T>()
        .map_err(|_| Error::InvalidArgument(arg.to_string()))
}

impl Command {
    /// Parses a single command line
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim();

        let Some(ubx) = line.strip_prefix(UBX_PREFIX) else {
            return Ok(Self::Text(line.to_string()));
        };

        let mut items = ubx.split_whitespace();
        let name = items.next().ok_or(Error::MissingArgument(line.to_string()))?;

        match name.to_uppercase().as_str() {
            "CFG-RATE" => {
                let measure_rate_ms = parse_arg::<u16>(items.next(), line)?;
                let nav_rate = match items.next() {
                    Some(rate) => parse_arg::<u16>(Some(rate), line)?,
                    None => 1,
                };
                Ok(Self::CfgRate {
                    measure_rate_ms,
                    nav_rate,
                })
            },
            "CFG-MSG" => {
                let message = parse_arg::<UbxMessage>(items.next(), line)?;
                let rate = parse_arg::<u8>(items.next(), line)?;
                Ok(Self::CfgMsg { message, rate })
            },
            "MON-VER" => Ok(Self::MonVer),
            _ => Err(Error::UnknownUbx(name.to_string())),
        }
    }

    /// Bytes to be sent to the receiver
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => format!("{}\r\n", text).into_bytes(),
            Self::CfgRate {
                measure_rate_ms,
                nav_rate,
            } => CfgRateBuilder {
                measure_rate_ms: *measure_rate_ms,
                nav_rate: *nav_rate,
                time_ref: AlignmentToReferenceTime::Gps,
            }
            .into_packet_bytes()
            .to_vec(),
            Self::CfgMsg { message, rate } => {
                let rates = [*rate; 6];
                match message {
                    UbxMessage::RxmRawx => CfgMsgAllPortsBuilder::set_rate_for::<RxmRawx>(rates)
                        .into_packet_bytes()
                        .to_vec(),
                    UbxMessage::RxmSfrbx => CfgMsgAllPortsBuilder::set_rate_for::<RxmSfrbx>(rates)
                        .into_packet_bytes()
                        .to_vec(),
                }
            },
            Self::MonVer => UbxPacketRequest::request_for::<MonVer>()
                .into_packet_bytes()
                .to_vec(),
        }
    }
}

/// Splits a command script into its non empty lines
pub fn lines(commands: &str) -> impl Iterator<Item = &str> {
    commands
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// Translates a command script into the bytes to be sent.
/// Invalid lines are logged and skipped.
pub fn encode(commands: &str) -> Vec<Vec<u8>> {
    lines(commands)
        .filter_map(|line| match Command::parse(line) {
            Ok(command) => {
                debug!("command: {:?}", command);
                Some(command.to_bytes())
            },
            Err(e) => {
                error!("startup command \"{}\": {}", line, e);
                None
            },
        })
        .collect()
}
