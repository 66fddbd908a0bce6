//! NTRIP (v1) client: HTTP handshake, then raw correction stream.
use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use log::{debug, info};

use crate::stream::{Error, Poll, interface::connect};

/// Default NTRIP caster port
pub const DEFAULT_PORT: u16 = 2101;

/// Max. response header size
const MAX_HEADER_LEN: usize = 4096;

/// `[user[:passwd]@]host[:port]/mountpoint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtripTarget {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
}

impl NtripTarget {
    pub fn parse(path: &str) -> Option<Self> {
        let (credentials, address) = match path.rsplit_once('@') {
            Some((credentials, address)) => (Some(credentials), address),
            None => (None, path),
        };

        let (user, password) = match credentials {
            Some(credentials) => match credentials.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(credentials.to_string()), None),
            },
            None => (None, None),
        };

        let (host, mountpoint) = address.split_once('/')?;

        let (host, port) = match host.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()?),
            None => (host, DEFAULT_PORT),
        };

        if host.is_empty() || mountpoint.is_empty() {
            return None;
        }

        Some(Self {
            user,
            password,
            port,
            host: host.to_string(),
            mountpoint: mountpoint.to_string(),
        })
    }

    /// Caster address
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// HTTP request for this mountpoint
    pub fn request(&self) -> String {
        let mut request = format!(
            "GET /{} HTTP/1.0\r\nUser-Agent: NTRIP rtksvr/{}\r\n",
            self.mountpoint,
            env!("CARGO_PKG_VERSION")
        );

        if let Some(user) = &self.user {
            let credentials = format!("{}:{}", user, self.password.as_deref().unwrap_or(""));
            request.push_str(&format!(
                "Authorization: Basic {}\r\n",
                BASE64.encode(credentials.as_bytes())
            ));
        }

        request.push_str("\r\n");
        request
    }
}

#[derive(Debug)]
enum Session {
    /// Waiting for the caster response, bytes received so far
    Handshake(Vec<u8>),
    /// Streaming corrections
    Streaming,
}

/// Outcome of the caster response parsing
#[derive(Debug, PartialEq)]
enum Response {
    /// Incomplete response
    Pending,
    /// Accepted, stream starts at this offset
    Accepted(usize),
    /// Rejected, with the response line
    Rejected(String),
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_response(header: &[u8]) -> Response {
    let Some(eol) = find(header, b"\r\n") else {
        return Response::Pending;
    };

    let line = String::from_utf8_lossy(&header[..eol]).to_string();

    if !line.contains("200 OK") {
        return Response::Rejected(line);
    }

    if line.starts_with("ICY") {
        return Response::Accepted(eol + 2);
    }

    // HTTP response: data follows the empty line
    match find(header, b"\r\n\r\n") {
        Some(end) => Response::Accepted(end + 4),
        None => Response::Pending,
    }
}

#[derive(Debug)]
pub struct NtripClient {
    stream: TcpStream,
    session: Session,
    mountpoint: String,
}

impl NtripClient {
    /// Connects to the caster and sends the request.
    /// The response is handled by [Self::poll], without blocking.
    pub fn connect(target: &NtripTarget) -> Result<Self, Error> {
        let mut stream = connect(&target.address())?;

        stream.write_all(target.request().as_bytes())?;
        stream.set_nonblocking(true)?;

        debug!("ntrip - requested /{} from {}", target.mountpoint, target.address());

        Ok(Self {
            stream,
            session: Session::Handshake(Vec::with_capacity(256)),
            mountpoint: target.mountpoint.clone(),
        })
    }

    pub fn poll(&mut self, buf: &mut [u8]) -> Result<Poll, Error> {
        let size = match self.stream.read(buf) {
            Ok(0) => return Ok(Poll::Eof),
            Ok(size) => size,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Poll::WouldBlock),
            Err(e) => return Err(e.into()),
        };

        let Session::Handshake(header) = &mut self.session else {
            return Ok(Poll::Data(size));
        };

        header.extend_from_slice(&buf[..size]);

        match parse_response(header) {
            Response::Pending => {
                if header.len() > MAX_HEADER_LEN {
                    return Err(Error::Ntrip("response header too long".to_string()));
                }
                Ok(Poll::WouldBlock)
            },
            Response::Rejected(line) => Err(Error::Ntrip(line)),
            Response::Accepted(offset) => {
                info!("ntrip - /{} streaming", self.mountpoint);

                // first stream bytes came with the header
                let data = header.split_off(offset);
                buf[..data.len()].copy_from_slice(&data);
                self.session = Session::Streaming;

                if data.is_empty() {
                    Ok(Poll::WouldBlock)
                } else {
                    Ok(Poll::Data(data.len()))
                }
            },
        }
    }

    /// Sends data to the caster (NMEA requests)
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        match self.stream.write(data) {
            Ok(size) => Ok(size),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
