use std::{
    fs::File,
    io::{BufReader, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

use flate2::{Compression, read::MultiGzDecoder, write::GzEncoder};
use log::{debug, info};
use serialport::SerialPort;

use crate::stream::{Endpoint, Error, Poll, ntrip::NtripClient};

/// Serial port read timeout. Reads are only issued when bytes are queued.
const SERIAL_TIMEOUT: Duration = Duration::from_millis(10);

/// TCP connection timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connects to `host:port` (blocking, with timeout)
pub(crate) fn connect(address: &str) -> Result<TcpStream, Error> {
    let mut last_error = None;

    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "unresolved address"))
        .into())
}

/// Non-blocking read, converting WouldBlock into [Poll::WouldBlock]
fn poll_read<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<Poll, Error> {
    match r.read(buf) {
        Ok(0) => Ok(Poll::Eof),
        Ok(size) => Ok(Poll::Data(size)),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
            Ok(Poll::WouldBlock)
        },
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking write. Data that the socket can't accept right away is dropped.
fn write_nonblocking(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(size) => written += size,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// File stream slot: read only for inputs, write only otherwise.
/// Files terminated by `.gz` are (de)compressed on the fly.
pub enum StreamFile {
    Input(BufReader<File>),
    GzInput(MultiGzDecoder<BufReader<File>>),
    Output(File),
    GzOutput(GzEncoder<File>),
}

impl StreamFile {
    /// Opens an input file, or creates (truncates) an output file
    pub fn open(path: &str, input: bool) -> std::io::Result<Self> {
        let gzip = path.ends_with(".gz");

        if input {
            let fd = BufReader::new(File::open(path)?);
            if gzip {
                Ok(Self::GzInput(MultiGzDecoder::new(fd)))
            } else {
                Ok(Self::Input(fd))
            }
        } else {
            let fd = File::create(path)?;
            if gzip {
                Ok(Self::GzOutput(GzEncoder::new(fd, Compression::new(5))))
            } else {
                Ok(Self::Output(fd))
            }
        }
    }

    fn poll(&mut self, buf: &mut [u8]) -> Result<Poll, Error> {
        match self {
            Self::Input(r) => poll_read(r, buf),
            Self::GzInput(r) => poll_read(r, buf),
            Self::Output(_) | Self::GzOutput(_) => Ok(Poll::WouldBlock),
        }
    }

    /// Appends to output files, input files accept nothing
    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Input(_) | Self::GzInput(_) => return Ok(0),
            Self::Output(w) => w.write_all(data)?,
            Self::GzOutput(w) => w.write_all(data)?,
        }
        Ok(data.len())
    }

    /// Flushes output files (gzip trailer included)
    fn finish(self) -> Result<(), Error> {
        match self {
            Self::Output(mut w) => w.flush()?,
            Self::GzOutput(w) => w.finish()?.flush()?,
            Self::Input(_) | Self::GzInput(_) => {},
        }
        Ok(())
    }
}

/// Listening socket and its connected clients
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    clients: Vec<(TcpStream, SocketAddr)>,
}

impl TcpServer {
    fn bind(address: &str) -> Result<Self, Error> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;

        info!("listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            clients: Vec::new(),
        })
    }

    /// Accepts all pending clients
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        debug!("{} - rejected: {}", addr, e);
                    } else {
                        info!("{} - new client", addr);
                        self.clients.push((stream, addr));
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("accept error: {}", e);
                    return;
                },
            }
        }
    }

    /// Reads from all clients, dropping those that disconnected
    fn poll(&mut self, buf: &mut [u8]) -> Poll {
        self.accept();

        let mut total = 0;

        self.clients.retain_mut(|(client, addr)| {
            if total == buf.len() {
                return true;
            }

            match poll_read(client, &mut buf[total..]) {
                Ok(Poll::Data(size)) => {
                    total += size;
                    true
                },
                Ok(Poll::WouldBlock) => true,
                Ok(Poll::Eof) => {
                    info!("{} - disconnected", addr);
                    false
                },
                Err(e) => {
                    debug!("{} - disconnected: {}", addr, e);
                    false
                },
            }
        });

        if total > 0 {
            Poll::Data(total)
        } else {
            Poll::WouldBlock
        }
    }

    /// Broadcasts to all clients, dropping those that failed
    fn write(&mut self, data: &[u8]) -> usize {
        self.accept();

        let mut written = 0;

        self.clients
            .retain_mut(|(client, addr)| match write_nonblocking(client, data) {
                Ok(size) => {
                    written = written.max(size);
                    true
                },
                Err(e) => {
                    debug!("{} - disconnected: {}", addr, e);
                    false
                },
            });

        written
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// I/O [Interface] of one stream slot
pub enum Interface {
    /// Serial port, to operate a receiver
    Serial(Box<dyn SerialPort>),
    /// TCP client
    TcpClient(TcpStream),
    /// TCP server, any number of clients
    TcpServer(TcpServer),
    /// NTRIP client
    Ntrip(NtripClient),
    /// Local file
    File(StreamFile),
}

impl Interface {
    /// Opens this [Endpoint], for reading (input) or writing.
    pub fn open(endpoint: &Endpoint, input: bool) -> Result<Self, Error> {
        match endpoint {
            Endpoint::Serial { port, baud } => {
                let port = serialport::new(port, *baud)
                    .timeout(SERIAL_TIMEOUT)
                    .open()?;
                Ok(Self::Serial(port))
            },
            Endpoint::TcpClient(address) => {
                let stream = connect(address)?;
                stream.set_nonblocking(true)?;
                Ok(Self::TcpClient(stream))
            },
            Endpoint::TcpServer(address) => Ok(Self::TcpServer(TcpServer::bind(address)?)),
            Endpoint::Ntrip(target) => Ok(Self::Ntrip(NtripClient::connect(target)?)),
            Endpoint::File(path) => Ok(Self::File(StreamFile::open(path, input)?)),
        }
    }

    /// Non-blocking read
    pub fn poll(&mut self, buf: &mut [u8]) -> Result<Poll, Error> {
        match self {
            Self::Serial(port) => {
                let queued = port.bytes_to_read()? as usize;
                if queued == 0 {
                    return Ok(Poll::WouldBlock);
                }
                let size = queued.min(buf.len());
                poll_read(port, &mut buf[..size])
            },
            Self::TcpClient(stream) => poll_read(stream, buf),
            Self::TcpServer(server) => Ok(server.poll(buf)),
            Self::Ntrip(client) => client.poll(buf),
            Self::File(file) => file.poll(buf),
        }
    }

    /// Writes (or broadcasts) data, returns the number of bytes sent.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        match self {
            Self::Serial(port) => {
                port.write_all(data)?;
                Ok(data.len())
            },
            Self::TcpClient(stream) => Ok(write_nonblocking(stream, data)?),
            Self::TcpServer(server) => Ok(server.write(data)),
            Self::Ntrip(client) => client.write(data),
            Self::File(file) => file.write(data),
        }
    }

    /// True when at least one peer is connected (TCP servers)
    pub fn has_clients(&self) -> bool {
        match self {
            Self::TcpServer(server) => !server.clients.is_empty(),
            _ => false,
        }
    }

    /// Bound address (TCP servers)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::TcpServer(server) => server.local_addr(),
            _ => None,
        }
    }

    /// Releases this [Interface], flushing pending output
    pub fn close(self) -> Result<(), Error> {
        match self {
            Self::Serial(mut port) => port.flush()?,
            Self::File(file) => file.finish()?,
            Self::TcpClient(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            },
            _ => {},
        }
        Ok(())
    }
}
