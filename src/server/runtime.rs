use std::{
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use hifitime::Epoch;
use log::{debug, error, info, trace, warn};
use nalgebra::Vector3;

use tokio::sync::{mpsc, watch};

use crate::{
    command,
    coords::azimuth_elevation,
    decoder::{Decoder, Message},
    ephemeris::EphemerisStore,
    nmea,
    observation::{ObservationEpoch, ReceiverRole},
    settings::{BasePosition, NmeaRequestKind, Settings},
    solution::{Solution, SolutionWriter},
    solver::{BaseReference, EpochMatcher, Solver},
    status::{ObservationStatus, SatelliteStatus, StreamState, StreamsStatus},
    stream::{self, Poll, StreamManager, StreamRole},
};

use super::{Request, Shared, lock};

/// Largest single read
const READ_CHUNK_SIZE: usize = 4096;

const SOLUTION_OUTPUTS: [StreamRole; 2] = [StreamRole::SolutionOut1, StreamRole::SolutionOut2];

/// Writes the startup commands of this receiver to its input stream, if open.
pub(crate) fn send_startup_commands(
    streams: &mut StreamManager,
    settings: &Settings,
    role: ReceiverRole,
) {
    let input = StreamRole::input(role);

    if !streams.is_open(input) {
        debug!("{} - not open: no commands sent", input);
        return;
    }

    for frame in command::encode(&settings.stream(input).commands) {
        match streams.write(input, &frame) {
            Ok(size) => trace!("{} - sent {} command bytes", input, size),
            Err(e) => {
                error!("{} - failed to send command: {}", input, e);
                return;
            },
        }
    }
}

/// True when the periodic NMEA request is due at `now`.
/// A null period means no request at all.
fn nmea_request_due(last: Option<Instant>, cycle_ms: u64, now: Instant) -> bool {
    if cycle_ms == 0 {
        return false;
    }

    let period = Duration::from_millis(cycle_ms);
    last.is_none_or(|last| now.saturating_duration_since(last) >= period)
}

/// Tracking status of a receiver, seen from this position (when known)
fn receiver_status(
    epoch: &ObservationEpoch,
    position: Option<Vector3<f64>>,
    ephemerides: &EphemerisStore,
) -> ObservationStatus {
    let satellites = epoch
        .l1_code_measurements()
        .map(|measurement| {
            let sky = position.and_then(|rx| {
                let ephemeris = ephemerides.select(measurement.sv, epoch.epoch)?;
                let state = ephemeris.satellite_state(epoch.epoch);
                Some(azimuth_elevation(&rx, &state.position))
            });

            let (azimuth, elevation) = sky.unwrap_or_default();

            SatelliteStatus {
                sv: measurement.sv,
                azimuth_deg: azimuth.to_degrees(),
                elevation_deg: elevation.to_degrees(),
                cn0_dbhz: measurement.cn0_dbhz,
                valid: sky.is_some(),
            }
        })
        .collect();

    ObservationStatus {
        role: epoch.role,
        epoch: Some(epoch.epoch),
        satellites,
    }
}

/// Processing thread: owns streams, decoders and the positioning core.
pub(crate) struct Runtime {
    settings: Settings,
    streams: StreamManager,
    shared: Arc<Shared>,
    requests: mpsc::Receiver<Request>,
    shutdown: watch::Receiver<bool>,

    /// One [Decoder] per configured input
    decoders: [Option<Decoder>; 3],

    ephemerides: EphemerisStore,
    matcher: EpochMatcher,
    solver: Solver,

    /// Base station position in use
    base_position: Option<Vector3<f64>>,

    writers: [SolutionWriter; 2],

    /// Header written on each solution output
    headers: [bool; 2],

    /// Last NMEA request toward the base
    last_nmea_request: Option<Instant>,

    /// Last fixed [Solution]
    last_fix: Option<Solution>,

    observations: [ObservationStatus; 3],

    /// Rover data was observed, exposed along with the snapshots
    rover_active: bool,

    /// Rover epochs processed
    processed_epochs: u64,
    cycle_failures: u64,
    message: String,

    buf: Vec<u8>,
}

impl Runtime {
    pub fn new(
        settings: Settings,
        streams: StreamManager,
        shared: Arc<Shared>,
        requests: mpsc::Receiver<Request>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let decoders = ReceiverRole::ALL.map(|role| {
            let stream = settings.stream(StreamRole::input(role));
            if stream.is_configured() {
                Some(Decoder::new(
                    role,
                    stream.format,
                    settings.buffer_size,
                    &stream.receiver_option,
                ))
            } else {
                None
            }
        });

        let base_position = match settings.processing.base_position {
            BasePosition::Fixed(ecef) => Some(Vector3::from(ecef)),
            BasePosition::FromStream => None,
        };

        Self {
            decoders,
            base_position,
            ephemerides: EphemerisStore::new(settings.processing.max_ephemeris_age_s),
            matcher: EpochMatcher::new(&settings.processing),
            solver: Solver::new(settings.processing.clone()),
            writers: settings.solution_outputs.clone().map(SolutionWriter::new),
            headers: [false; 2],
            last_nmea_request: None,
            last_fix: None,
            observations: ReceiverRole::ALL.map(ObservationStatus::empty),
            rover_active: false,
            processed_epochs: 0,
            cycle_failures: 0,
            message: String::new(),
            buf: vec![0; settings.buffer_size.min(READ_CHUNK_SIZE)],
            settings,
            streams,
            shared,
            requests,
            shutdown,
        }
    }

    /// True when the server requested the thread to exit
    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Runs until shutdown, then hands the streams back to the server.
    pub fn run(mut self) -> StreamManager {
        let period = Duration::from_millis(self.settings.cycle_ms);
        let mut last_cycle = Instant::now();

        info!("processing deployed (cycle: {:?})", period);

        loop {
            if self.shutdown_requested() {
                debug!("shutdown requested");
                break;
            }

            let t0 = Instant::now();
            let elapsed = t0 - last_cycle;
            last_cycle = t0;

            if let Err(e) = self.cycle(elapsed) {
                error!("processing cycle failure: {}", e);
                self.cycle_failures += 1;
                self.message = e.to_string();
            }

            self.publish_snapshots();

            let spent = t0.elapsed();
            if spent < period {
                std::thread::sleep(period - spent);
            }
        }

        self.streams
    }

    /// One processing cycle. Errors are reported once all steps ran.
    fn cycle(&mut self, elapsed: Duration) -> Result<(), stream::Error> {
        let mut failure = None;

        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::StartupCommands(role) => {
                    send_startup_commands(&mut self.streams, &self.settings, role);
                },
            }
        }

        self.poll_inputs();

        for role in ReceiverRole::ALL {
            let messages = match &mut self.decoders[role.index()] {
                Some(decoder) => decoder.decode(),
                None => continue,
            };

            for message in messages {
                self.route(role, message);
            }
        }

        let base_active = self.streams.state(StreamRole::BaseIn) == StreamState::Active;

        for matched in self.matcher.poll(elapsed.as_secs_f64(), base_active) {
            let base = match (&matched.base, self.base_position) {
                (Some(epoch), Some(position_ecef_m)) => Some(BaseReference {
                    epoch,
                    position_ecef_m,
                }),
                _ => None,
            };

            let solution = self.solver.fuse(&matched.rover, base, &self.ephemerides);
            self.processed_epochs += 1;

            self.observations[ReceiverRole::Rover.index()] = ObservationStatus {
                role: ReceiverRole::Rover,
                epoch: Some(matched.rover.epoch),
                satellites: self.solver.satellites().to_vec(),
            };

            match self.solver.last_error() {
                Some(e) => self.message = format!("{} - {}", solution.epoch, e),
                None => {
                    self.last_fix = Some(solution);
                    self.message.clear();
                },
            }

            self.shared.solutions.publish(solution);

            if let Err(e) = self.write_solution(&solution) {
                failure = Some(e);
            }
        }

        self.nmea_request();

        let period = Duration::from_millis(self.settings.reconnect_ms);

        for role in self.streams.reconnect(period) {
            if let Some(receiver) = role.receiver() {
                send_startup_commands(&mut self.streams, &self.settings, receiver);
            }

            if let Some(index) = SOLUTION_OUTPUTS.iter().position(|output| *output == role) {
                self.headers[index] = false;
            }
        }

        self.streams.end_cycle(elapsed);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads all inputs within the byte budget, copying raw data to the log streams.
    fn poll_inputs(&mut self) {
        for role in ReceiverRole::ALL {
            let Some(decoder) = &mut self.decoders[role.index()] else {
                continue;
            };

            let input = StreamRole::input(role);
            let log = StreamRole::log(role);
            let mut budget = self.settings.buffer_size;

            while budget > 0 {
                let chunk = budget.min(self.buf.len());

                let size = match self.streams.poll_bytes(input, &mut self.buf[..chunk]) {
                    Poll::Data(0) | Poll::Eof | Poll::WouldBlock => break,
                    Poll::Data(size) => size,
                };

                if self.streams.is_open(log) {
                    if let Err(e) = self.streams.write(log, &self.buf[..size]) {
                        warn!("{} - {}", log, e);
                    }
                }

                decoder.push(&self.buf[..size]);
                budget -= size;
            }
        }
    }

    /// Routes a decoded [Message] to the processing core.
    fn route(&mut self, role: ReceiverRole, message: Message) {
        let input = StreamRole::input(role);

        if role == ReceiverRole::Correction {
            self.streams.set_active(input);
        }

        match message {
            Message::Observation(epoch) => {
                trace!("{} - {} epoch ({} meas.)", epoch.epoch, role, epoch.measurements.len());

                self.streams.set_active(input);

                // align truncated time fields of all inputs
                for decoder in self.decoders.iter_mut().flatten() {
                    if decoder.role() != role {
                        decoder.set_time_reference(epoch.epoch);
                    }
                }

                match role {
                    ReceiverRole::Rover => {
                        self.rover_active = true;
                        self.matcher.push_rover(epoch);
                    },
                    ReceiverRole::Base => {
                        self.observations[role.index()] =
                            receiver_status(&epoch, self.base_position, &self.ephemerides);
                        self.matcher.push_base(epoch);
                    },
                    ReceiverRole::Correction => {
                        self.observations[role.index()] =
                            receiver_status(&epoch, None, &self.ephemerides);
                    },
                }
            },
            Message::Ephemeris(ephemeris) => {
                if self.settings.nav_select.accepts(role) {
                    self.ephemerides.insert(ephemeris);
                } else {
                    trace!("{}({}) - {} ephemeris ignored", ephemeris.toe(), ephemeris.sv, role);
                }
            },
            Message::StationPosition(position) => {
                if role == ReceiverRole::Rover {
                    return;
                }

                self.streams.set_active(input);

                if self.settings.processing.base_position == BasePosition::FromStream
                    && self.base_position != Some(position)
                {
                    info!(
                        "{} - base position: {:.4} {:.4} {:.4}",
                        role, position[0], position[1], position[2]
                    );
                    self.base_position = Some(position);
                }
            },
        }
    }

    /// Writes a [Solution] to the solution outputs.
    fn write_solution(&mut self, solution: &Solution) -> Result<(), stream::Error> {
        let mut failure = None;

        for (index, output) in SOLUTION_OUTPUTS.into_iter().enumerate() {
            if !self.streams.is_open(output) {
                continue;
            }

            if !self.headers[index] {
                if let Some(header) = self.writers[index].header() {
                    if let Err(e) = self.streams.write(output, header.as_bytes()) {
                        failure = Some(e);
                        continue;
                    }
                }
                self.headers[index] = true;
            }

            let Some(formatted) = self.writers[index].format(solution) else {
                continue;
            };

            if let Err(e) = self.streams.write(output, formatted.as_bytes()) {
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Periodic NMEA GGA report toward the base stream (NTRIP VRS casters)
    fn nmea_request(&mut self) {
        let request = &self.settings.nmea_request;

        if request.kind == NmeaRequestKind::None || !self.streams.is_open(StreamRole::BaseIn) {
            return;
        }

        if !nmea_request_due(self.last_nmea_request, request.cycle_ms, Instant::now()) {
            return;
        }

        let sentence = match request.kind {
            NmeaRequestKind::BasePos => match Epoch::now() {
                Ok(now) => nmea::gga(now, &Vector3::from(request.position_ecef_m), 1, 0, 1.0, None),
                Err(e) => {
                    error!("nmea request: failed to determine system time: {}", e);
                    return;
                },
            },
            NmeaRequestKind::SingleSolution => match &self.last_fix {
                Some(fix) => nmea::gga(fix.epoch, &fix.position(), 1, fix.satellites, 1.0, None),
                None => return,
            },
            NmeaRequestKind::None => return,
        };

        self.last_nmea_request = Some(Instant::now());

        match self.streams.write(StreamRole::BaseIn, sentence.as_bytes()) {
            Ok(_) => trace!("{} - {}", StreamRole::BaseIn, sentence.trim_end()),
            Err(e) => warn!("{} - nmea request: {}", StreamRole::BaseIn, e),
        }
    }

    /// Refreshes the snapshots exposed by the server
    fn publish_snapshots(&self) {
        let stats = self
            .decoders
            .iter()
            .flatten()
            .map(|decoder| decoder.stats())
            .fold((0, 0, 0), |acc, stats| {
                (
                    acc.0 + stats.decoded_frames,
                    acc.1 + stats.corrupt_frames,
                    acc.2 + stats.dropped_bytes,
                )
            });

        {
            let mut control = lock(&self.shared.control);
            control.solution = self.shared.solutions.read_last();
            control.base_position = self.base_position;
            control.age_s = control.solution.map(|s| s.age_s).unwrap_or_default();
            control.valid_satellites = control.solution.map(|s| s.satellites).unwrap_or_default();
            control.processed_epochs = self.processed_epochs;
            control.decoded_frames = stats.0;
            control.corrupt_frames = stats.1;
            control.dropped_bytes = stats.2;
            control.cycle_failures = self.cycle_failures;
            control.message = self.message.clone();
        }

        *lock(&self.shared.streams) = StreamsStatus {
            streams: self.streams.status(),
            message: self.message.clone(),
        };

        *lock(&self.shared.observations) = self.observations.clone();

        // promotion may only follow consistent snapshots
        self.shared
            .rover_active
            .store(self.rover_active, Ordering::Release);
    }
}
