// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host std backend for dlcserviced: transport, frame dispatch and
//! the daemon loop
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/server.rs
//!
//! PUBLIC API:
//!   - service_main_loop(): Builds the service from config and serves the socket
//!   - run_loop(): Serves frames from any [`Transport`]
//!   - SignalQueue: Collects `DlcStateChanged` notifications for the client
//!
//! DEPENDENCIES:
//!   - dlc: DLC engine
//!   - std::os::unix::net: Host transport

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dlc::proxies::Unavailable;
use dlc::{
    BootSlot, Collaborators, DlcError, DlcManager, DlcState, StateChangeReporter, SysfsBootDevice,
    SystemClock, SystemState,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::protocol::{self, ProtocolError};
use crate::service::DlcService;

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
// A zero read timeout means "block forever" to the socket layer.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Result alias for operations in this module.
pub type Result<T> = core::result::Result<T, ServerError>;

/// Notifies the supervisor once the daemon is ready.
pub struct ReadyNotifier(Box<dyn FnOnce() + Send>);

impl ReadyNotifier {
    /// Creates a new notifier from `func`.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Emits the ready signal.
    pub fn notify(self) {
        (self.0)();
    }
}

/// Errors emitted while serving requests.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// Failed to decode a request frame.
    #[error("decode error: {0}")]
    Decode(ProtocolError),
    /// Failed to encode a response frame.
    #[error("encode error: {0}")]
    Encode(ProtocolError),
    /// The DLC engine failed to start.
    #[error("service error: {0}")]
    Service(DlcError),
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(ConfigError),
}

impl From<TransportError> for ServerError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<DlcError> for ServerError {
    fn from(value: DlcError) -> Self {
        Self::Service(value)
    }
}

impl From<ConfigError> for ServerError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Transport abstraction used by the daemon.
pub trait Transport {
    /// Error type returned by the transport.
    type Error: Into<TransportError>;

    /// Receives the next frame. `None` means the transport is closed; an
    /// empty frame means the wait timed out. Errors other than
    /// [`TransportError::Closed`] concern a single peer and do not end the
    /// loop.
    fn recv(&mut self) -> core::result::Result<Option<Vec<u8>>, Self::Error>;

    /// Sends a frame to the peer.
    fn send(&mut self, frame: &[u8]) -> core::result::Result<(), Self::Error>;

    /// Bounds the next [`Transport::recv`] wait. `None` waits indefinitely.
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}
}

/// Transport level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection closed.
    #[error("transport closed")]
    Closed,
    /// I/O failure.
    #[error("io error: {0}")]
    Io(String),
    /// Any other failure.
    #[error("transport error: {0}")]
    Other(String),
}

impl From<io::Error> for TransportError {
    fn from(value: io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Unix stream socket serving one client at a time. Frames carry a `u32`
/// little-endian length prefix.
pub struct UnixTransport {
    listener: UnixListener,
    path: PathBuf,
    stream: Option<UnixStream>,
    timeout: Option<Duration>,
}

impl UnixTransport {
    /// Binds `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> core::result::Result<Self, TransportError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, path: path.to_path_buf(), stream: None, timeout: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn accept(&mut self) -> core::result::Result<bool, TransportError> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                debug!("dlcserviced: client connected");
                self.stream = Some(stream);
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let nap = self.timeout.map_or(ACCEPT_POLL, |timeout| timeout.min(ACCEPT_POLL));
                std::thread::sleep(nap);
                Ok(false)
            }
            Err(err) => {
                std::thread::sleep(ACCEPT_POLL);
                Err(err.into())
            }
        }
    }
}

impl Transport for UnixTransport {
    type Error = TransportError;

    fn recv(&mut self) -> core::result::Result<Option<Vec<u8>>, Self::Error> {
        if self.stream.is_none() && !self.accept()? {
            return Ok(Some(Vec::new()));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Some(Vec::new()));
        };

        // Only the first byte waits for the timer deadline; the rest of a
        // frame is read blocking so a frame is never split.
        stream.set_read_timeout(self.timeout.map(|timeout| timeout.max(MIN_READ_TIMEOUT)))?;
        let mut len = [0u8; 4];
        match stream.read(&mut len[..1]) {
            Ok(0) => {
                debug!("dlcserviced: client disconnected");
                self.stream = None;
                return Ok(Some(Vec::new()));
            }
            Ok(_) => {}
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(Some(Vec::new()));
            }
            Err(err) => {
                self.stream = None;
                return Err(err.into());
            }
        }
        stream.set_read_timeout(None)?;
        let result = read_frame_rest(stream, len);
        if result.is_err() {
            self.stream = None;
        }
        result.map(Some)
    }

    fn send(&mut self, frame: &[u8]) -> core::result::Result<(), Self::Error> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let len = u32::try_from(frame.len())
            .map_err(|_| TransportError::Other(format!("frame of {} bytes is too large", frame.len())))?;
        let written = stream.write_all(&len.to_le_bytes()).and_then(|()| stream.write_all(frame));
        if let Err(err) = written {
            self.stream = None;
            return Err(err.into());
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }
}

fn read_frame_rest(
    stream: &mut UnixStream,
    mut len: [u8; 4],
) -> core::result::Result<Vec<u8>, TransportError> {
    stream.read_exact(&mut len[1..])?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Other(format!("frame of {len} bytes exceeds limit")));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}

/// Reporter that buffers state changes until the loop forwards them.
#[derive(Clone, Default)]
pub struct SignalQueue {
    pending: Arc<Mutex<VecDeque<DlcState>>>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<DlcState> {
        self.pending.lock().drain(..).collect()
    }
}

impl StateChangeReporter for SignalQueue {
    fn dlc_state_changed(&self, state: &DlcState) {
        self.pending.lock().push_back(state.clone());
    }
}

/// Builds the service from `config` and serves its Unix socket until the
/// transport closes.
pub fn service_main_loop(config: &Config, notifier: ReadyNotifier) -> Result<()> {
    let signals = SignalQueue::new();
    let boot_device =
        SysfsBootDevice::with_roots(config.boot.cmdline.clone(), config.boot.sys_block.clone());
    let boot_slot = BootSlot::detect(&boot_device)?;
    info!(
        "dlcserviced: booted from slot {} (removable={})",
        boot_slot.active().name(),
        boot_slot.is_removable()
    );
    let system = Arc::new(SystemState::new(
        Collaborators {
            image_loader: Arc::new(Unavailable("imageloader")),
            update_engine: Arc::new(Unavailable("update_engine")),
            session_manager: Arc::new(Unavailable("session_manager")),
            reporter: Arc::new(signals.clone()),
        },
        boot_slot,
        config.paths(),
        Arc::new(SystemClock),
        config.expiry(),
    ));
    SystemState::initialize(system.clone(), false)?;
    let manager = DlcManager::new(system)?;
    let mut service = DlcService::new(manager, config.timers());
    // Startup transitions are not addressed to any client.
    signals.drain();

    let mut transport = UnixTransport::bind(&config.server.socket)?;
    info!("dlcserviced: listening on {}", transport.path().display());
    notifier.notify();
    run_loop(&mut transport, &mut service, &signals)
}

/// Serves frames until the transport closes, running due timers between
/// frames. The service is shut down on exit.
pub fn run_loop<T>(transport: &mut T, service: &mut DlcService, signals: &SignalQueue) -> Result<()>
where
    T: Transport,
{
    println!("dlcserviced: ready");
    let result = serve(transport, service, signals);
    service.shutdown();
    result
}

fn serve<T>(transport: &mut T, service: &mut DlcService, signals: &SignalQueue) -> Result<()>
where
    T: Transport,
{
    loop {
        service.run_pending();
        flush_signals(transport, signals);
        transport.set_timeout(service.next_deadline());
        let frame = match transport.recv().map_err(Into::<TransportError>::into) {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(TransportError::Closed) => return Ok(()),
            Err(err) => {
                warn!("dlcserviced: dropped client: {err}");
                continue;
            }
        };
        if frame.is_empty() {
            continue;
        }
        if let Err(err) = handle_frame(service, transport, &frame) {
            error!("dlcserviced: handle error: {err}");
        }
        flush_signals(transport, signals);
    }
}

fn handle_frame<T>(service: &mut DlcService, transport: &mut T, frame: &[u8]) -> Result<()>
where
    T: Transport,
{
    let (op, result) = match protocol::decode_request(frame) {
        Ok(request) => (request.op(), service.handle(request)),
        Err(err) => {
            // Without a readable header there is no opcode to answer.
            let op = protocol::request_op(frame).map_err(ServerError::Decode)?;
            warn!("dlcserviced: malformed request {op:#04x}: {err}");
            (op, Err(DlcError::internal(format!("malformed request: {err}"))))
        }
    };
    let response = protocol::encode_response(op, &result).map_err(ServerError::Encode)?;
    transport.send(&response).map_err(|err| ServerError::Transport(err.into()))
}

fn flush_signals<T>(transport: &mut T, signals: &SignalQueue)
where
    T: Transport,
{
    for state in signals.drain() {
        let frame = match protocol::encode_state_changed(&state) {
            Ok(frame) => frame,
            Err(err) => {
                error!("dlcserviced: failed to encode state of {}: {err}", state.id);
                continue;
            }
        };
        if let Err(err) = transport.send(&frame) {
            let err: TransportError = err.into();
            warn!("dlcserviced: dropped state signal for {}: {err}", state.id);
        }
    }
}
