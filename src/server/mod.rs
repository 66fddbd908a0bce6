//! Server lifecycle and snapshots.
//!
//! The [RtkServer] owns the configuration and a processing thread.
//! The processing thread owns the streams, decoders and the positioning core,
//! and refreshes the shared snapshots once per cycle.
use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use hifitime::Epoch;
use log::{debug, error, info, warn};
use thiserror::Error;

use tokio::sync::{mpsc, watch};

mod runtime;

use runtime::Runtime;

use crate::{
    observation::ReceiverRole,
    settings::{self, Settings},
    solution::{Solution, SolutionBuffer},
    status::{ControlResult, ObservationStatus, ServerState, StreamsStatus},
    stream::{self, StreamManager},
};

/// Pending requests toward the processing thread
const REQUEST_QUEUE_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation not allowed while {0}")]
    InvalidState(ServerState),
    #[error("invalid settings: {0}")]
    Settings(#[from] settings::Error),
    #[error("start failure: {0}")]
    StartFailure(#[from] stream::Error),
    #[error("failed to spawn processing thread: {0}")]
    ThreadSpawn(std::io::Error),
}

/// Requests sent to the processing thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    /// (Re)sends the startup commands of this receiver
    StartupCommands(ReceiverRole),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the processing thread and the pollers
#[derive(Debug)]
pub(crate) struct Shared {
    pub streams: Mutex<StreamsStatus>,
    pub observations: Mutex<[ObservationStatus; 3]>,
    pub control: Mutex<ControlResult>,
    pub solutions: SolutionBuffer,
    /// Rover data was observed
    pub rover_active: AtomicBool,
}

impl Shared {
    fn new(solution_buffer_size: usize) -> Self {
        Self {
            streams: Mutex::new(StreamsStatus::closed()),
            observations: Mutex::new(ReceiverRole::ALL.map(ObservationStatus::empty)),
            control: Mutex::new(ControlResult::default()),
            solutions: SolutionBuffer::new(solution_buffer_size),
            rover_active: AtomicBool::new(false),
        }
    }

    /// Clears the snapshots of the previous run, buffered solutions are kept.
    fn reset(&self, streams: StreamsStatus) {
        *lock(&self.streams) = streams;
        *lock(&self.observations) = ReceiverRole::ALL.map(ObservationStatus::empty);
        *lock(&self.control) = ControlResult::default();
        self.rover_active.store(false, Ordering::Release);
    }
}

/// Real-time GNSS processing server.
///
/// ```no_run
/// use rtksvr::prelude::*;
///
/// let settings = Settings::from_file("settings.json").unwrap();
///
/// let mut server = RtkServer::new(settings).unwrap();
/// server.start().unwrap();
///
/// if let Some(solution) = server.last_solution() {
///     println!("{:?}", solution.geodetic());
/// }
///
/// server.stop();
/// ```
pub struct RtkServer {
    settings: Settings,
    state: Mutex<ServerState>,
    shared: Arc<Shared>,
    requests: Option<mpsc::Sender<Request>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<StreamManager>>,
}

impl RtkServer {
    /// Creates a new [RtkServer], in [ServerState::Closed] state.
    pub fn new(settings: Settings) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(settings.solution_buffer_size)),
            settings,
            state: Mutex::new(ServerState::Closed),
            requests: None,
            shutdown: None,
            handle: None,
        })
    }

    fn set_state(&self, state: ServerState) {
        *lock(&self.state) = state;
    }

    /// Current [ServerState]
    pub fn status(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Copy of current [Settings]
    pub fn settings(&self) -> Settings {
        self.settings.clone()
    }

    /// Replaces the [Settings]. Only allowed in [ServerState::Closed] state.
    pub fn set_settings(&mut self, settings: Settings) -> Result<(), Error> {
        let state = self.status();
        if state != ServerState::Closed {
            return Err(Error::InvalidState(state));
        }

        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Opens the streams, sends the startup commands and deploys the processing thread.
    /// On failure, every stream is closed and the server is in [ServerState::Error].
    pub fn start(&mut self) -> Result<(), Error> {
        let state = self.status();
        if matches!(state, ServerState::Waiting | ServerState::Active) {
            return Err(Error::InvalidState(state));
        }

        match self.deploy() {
            Ok(_) => {
                self.set_state(ServerState::Waiting);
                info!("server deployed");
                Ok(())
            },
            Err(e) => {
                error!("failed to start: {}", e);
                self.set_state(ServerState::Error);
                Err(e)
            },
        }
    }

    fn deploy(&mut self) -> Result<(), Error> {
        self.settings.validate()?;

        let mut streams = StreamManager::new();
        streams.configure(&self.settings.streams)?;
        streams.open_all()?;

        for role in ReceiverRole::ALL {
            runtime::send_startup_commands(&mut streams, &self.settings, role);
        }

        let shared = Arc::new(Shared::new(self.settings.solution_buffer_size));

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runtime = Runtime::new(
            self.settings.clone(),
            streams,
            Arc::clone(&shared),
            requests_rx,
            shutdown_rx,
        );

        // closure (and streams) are released on failure
        let handle = std::thread::Builder::new()
            .name("rtksvr".to_string())
            .spawn(move || runtime.run())
            .map_err(Error::ThreadSpawn)?;

        self.shared = shared;
        self.requests = Some(requests_tx);
        self.shutdown = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Stops the processing thread and closes all streams. Idempotent.
    /// Stream, observation and control snapshots return to their idle state,
    /// buffered solutions remain available.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            if shutdown.send(true).is_err() {
                warn!("processing thread already exited");
            }
        }

        self.requests = None;

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(mut streams) => {
                    streams.close_all();
                    self.shared.reset(StreamsStatus {
                        streams: streams.status(),
                        message: String::new(),
                    });
                },
                Err(_) => {
                    error!("processing thread panicked");
                    self.shared.reset(StreamsStatus::closed());
                },
            }
            info!("server stopped");
        }

        self.set_state(ServerState::Closed);
    }

    /// Status of all streams.
    /// Promotes the server to [ServerState::Active] once rover data was observed.
    pub fn stream_status(&self) -> StreamsStatus {
        let status = lock(&self.shared.streams).clone();

        if self.shared.rover_active.load(Ordering::Acquire) {
            let mut state = lock(&self.state);
            if *state == ServerState::Waiting {
                debug!("rover data observed");
                *state = ServerState::Active;
            }
        }

        status
    }

    /// Tracking status of this receiver
    pub fn observation_status(&self, role: ReceiverRole) -> ObservationStatus {
        lock(&self.shared.observations)[role.index()].clone()
    }

    pub fn control_result(&self) -> ControlResult {
        lock(&self.shared.control).clone()
    }

    pub fn last_solution(&self) -> Option<Solution> {
        self.shared.solutions.read_last()
    }

    /// Buffered solutions strictly after `t`, oldest first
    pub fn solutions_since(&self, t: Epoch) -> std::vec::IntoIter<Solution> {
        self.shared.solutions.read_since(t)
    }

    /// Requests the processing thread to send the startup commands of this receiver.
    /// No-op when the server is not running.
    pub fn send_startup_commands(&self, role: ReceiverRole) {
        let Some(requests) = &self.requests else {
            debug!("{} - server not running: no commands sent", role);
            return;
        };

        if let Err(e) = requests.try_send(Request::StartupCommands(role)) {
            error!("{} - failed to queue startup commands: {}", role, e);
        }
    }
}

impl Drop for RtkServer {
    fn drop(&mut self) {
        self.stop();
    }
}
