use pty_manager::{
    ExitStatus, PtyBackend, PtyConfig, PtyControl, PtyError, PtyEvent, SpawnError, SpawnedPty,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::AppState;
use crate::auth::{IdentityValidator, TokenListValidator};
use crate::config::SessionConfig;
use crate::metrics::ServerMetrics;
use crate::session_actor::{ClientEvent, SessionContext};
use crate::session_registry::SessionRegistry;

/// In-memory `PtyBackend` whose processes are driven by the test.
#[derive(Default)]
pub struct FakeBackend {
    ignore_sigterm: bool,
    next_pid: AtomicU32,
    spawns: Mutex<Vec<PtyConfig>>,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    fail_next: Mutex<Option<SpawnError>>,
    spawn_delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Processes from this backend only exit on a forceful terminate.
    pub fn ignoring_sigterm() -> Arc<Self> {
        Arc::new(Self {
            ignore_sigterm: true,
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    pub fn fail_next_spawn(&self, err: SpawnError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Make every later spawn block its thread for `delay`, like a slow exec.
    pub fn delay_spawns(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = Some(delay);
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    pub fn spawn_configs(&self) -> Vec<PtyConfig> {
        self.spawns.lock().unwrap().clone()
    }

    pub fn last_process(&self) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no process spawned")
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, config: PtyConfig) -> Result<SpawnedPty, SpawnError> {
        self.spawns.lock().unwrap().push(config);
        let delay = *self.spawn_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }

        let (events_tx, events) = mpsc::channel(256);
        let process = Arc::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            ignore_sigterm: self.ignore_sigterm,
            events_tx,
            exited: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
        });
        self.processes.lock().unwrap().push(process.clone());

        Ok(SpawnedPty {
            control: process,
            events,
        })
    }
}

pub struct FakeProcess {
    pid: u32,
    ignore_sigterm: bool,
    events_tx: mpsc::Sender<PtyEvent>,
    exited: AtomicBool,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    terminations: Mutex<Vec<bool>>,
}

impl FakeProcess {
    pub async fn emit(&self, data: &[u8]) {
        let _ = self.events_tx.send(PtyEvent::Output(data.to_vec())).await;
    }

    pub async fn exit(&self, status: ExitStatus) {
        if !self.exited.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(PtyEvent::Exited(status)).await;
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    /// `true` for each graceful request, `false` for each forceful one.
    pub fn terminations(&self) -> Vec<bool> {
        self.terminations.lock().unwrap().clone()
    }
}

impl PtyControl for FakeProcess {
    fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PtyError::ProcessExited);
        }
        self.written.lock().unwrap().extend_from_slice(&data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(PtyError::ProcessExited);
        }
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn terminate(&self, graceful: bool) -> Result<(), PtyError> {
        self.terminations.lock().unwrap().push(graceful);
        if graceful && self.ignore_sigterm {
            return Ok(());
        }
        if !self.exited.swap(true, Ordering::SeqCst) {
            let signal = if graceful { "SIGTERM" } else { "SIGKILL" };
            let _ = self
                .events_tx
                .try_send(PtyEvent::Exited(ExitStatus::with_signal(signal)));
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

pub fn test_context(backend: &Arc<FakeBackend>) -> SessionContext {
    let (status_tx, _) = broadcast::channel(64);
    SessionContext {
        backend: backend.clone(),
        config: Arc::new(SessionConfig::for_tests()),
        metrics: Arc::new(ServerMetrics::new()),
        status_tx,
    }
}

pub fn test_registry(backend: &Arc<FakeBackend>) -> Arc<SessionRegistry> {
    test_registry_with(backend, SessionConfig::for_tests())
}

pub fn test_registry_with(backend: &Arc<FakeBackend>, config: SessionConfig) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        backend.clone(),
        config,
        Arc::new(ServerMetrics::new()),
    ))
}

/// Build an `AppState` around a fake backend. `tokens` enables identity checks.
pub fn test_app_state(backend: &Arc<FakeBackend>, tokens: Option<&[&str]>) -> AppState {
    let registry = test_registry(backend);
    let validator: Arc<dyn IdentityValidator> = match tokens {
        Some(tokens) => Arc::new(TokenListValidator::new(
            tokens.iter().map(|t| t.to_string()),
        )),
        None => Arc::new(crate::auth::AllowAll),
    };
    AppState {
        metrics: registry.metrics(),
        registry,
        validator,
    }
}

/// Next event for an attached client, failing the test if none arrives.
pub async fn next_client_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client event stream closed")
}
