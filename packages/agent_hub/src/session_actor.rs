use chrono::{DateTime, Utc};
use pty_manager::{
    ExitStatus, OutputRingBuffer, PtyBackend, PtyControl, PtyError, PtyEvent, SpawnError,
    SpawnedPty,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::params::SpawnParams;

pub type ClientId = String;

/// Lifecycle state of a session record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Running,
    Idle,
    Exited,
    Error,
}

impl SessionStatus {
    /// A live record owns a process.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::Idle
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Stopped => "stopped",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Exited => "exited",
            SessionStatus::Error => "error",
        }
    }
}

/// How the most recent process ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub reason: String,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        let reason = match (&status.signal, status.code) {
            (Some(signal), _) => format!("terminated by signal {}", signal),
            (None, Some(code)) => format!("exited with code {}", code),
            (None, None) => "exited with unknown status".to_string(),
        };
        Self {
            code: status.code,
            signal: status.signal.clone(),
            reason,
        }
    }

    fn stopped(status: &ExitStatus) -> Self {
        Self {
            code: status.code,
            signal: status.signal.clone(),
            reason: "stopped".to_string(),
        }
    }

    fn spawn_failed(err: &SpawnError) -> Self {
        Self {
            code: None,
            signal: None,
            reason: err.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

/// Point-in-time view of a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub spawn_params: SpawnParams,
    pub pid: Option<u32>,
    pub geometry: Geometry,
    pub attached_clients: usize,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub exit_info: Option<ExitInfo>,
}

/// Delivered to each attached client, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Output(Vec<u8>),
    /// A fresh process replaced the previous one; scrollback was reset.
    Started,
    Exited(ExitInfo),
}

/// Result of attaching: scrollback as of the attach, then the live stream.
pub struct Attachment {
    /// Input and resize go straight to the record, never through the registry.
    pub handle: SessionHandle,
    pub client_id: ClientId,
    pub snapshot: Vec<u8>,
    pub status: SessionStatus,
    /// Present when the record is not live, so the client learns why.
    pub exit_info: Option<ExitInfo>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Broadcast on every status transition of any session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusNotice {
    pub session_id: String,
    pub status: SessionStatus,
    pub exit_info: Option<ExitInfo>,
    pub at: DateTime<Utc>,
}

/// Shared dependencies injected into every session actor.
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn PtyBackend>,
    pub config: Arc<SessionConfig>,
    pub metrics: Arc<ServerMetrics>,
    pub status_tx: broadcast::Sender<StatusNotice>,
}

/// Commands that can be sent to a session actor
enum SessionCommand {
    GetInfo {
        respond_to: oneshot::Sender<SessionInfo>,
    },
    Start {
        params: Option<SpawnParams>,
        respond_to: oneshot::Sender<Result<SessionInfo, SessionError>>,
    },
    Stop {
        respond_to: oneshot::Sender<SessionInfo>,
    },
    Attach {
        client_id: ClientId,
        start_if_stopped: bool,
        geometry: Option<Geometry>,
        respond_to: oneshot::Sender<Attached>,
    },
    Detach {
        client_id: ClientId,
        respond_to: oneshot::Sender<bool>,
    },
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Resize {
        geometry: Geometry,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    /// End the actor if no process is live.
    Retire {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Handle to communicate with a session actor
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .map_err(|_| SessionError::NotFound(self.id.clone()))?;
        rx.await.map_err(|_| SessionError::NotFound(self.id.clone()))
    }

    pub async fn info(&self) -> Result<SessionInfo, SessionError> {
        self.request(|respond_to| SessionCommand::GetInfo { respond_to })
            .await
    }

    /// Start the process, replacing the stored params when given.
    pub async fn start(&self, params: Option<SpawnParams>) -> Result<SessionInfo, SessionError> {
        self.request(|respond_to| SessionCommand::Start { params, respond_to })
            .await?
    }

    /// Resolves once the process is gone (or immediately if there is none).
    pub async fn stop(&self) -> Result<SessionInfo, SessionError> {
        self.request(|respond_to| SessionCommand::Stop { respond_to })
            .await
    }

    pub async fn attach(
        &self,
        client_id: ClientId,
        start_if_stopped: bool,
        geometry: Option<Geometry>,
    ) -> Result<Attachment, SessionError> {
        let attached = self
            .request(|respond_to| SessionCommand::Attach {
                client_id,
                start_if_stopped,
                geometry,
                respond_to,
            })
            .await?;
        Ok(Attachment {
            handle: self.clone(),
            client_id: attached.client_id,
            snapshot: attached.snapshot,
            status: attached.status,
            exit_info: attached.exit_info,
            events: attached.events,
        })
    }

    pub async fn detach(&self, client_id: ClientId) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionCommand::Detach {
            client_id,
            respond_to,
        })
        .await
    }

    pub async fn write_input(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::WriteInput { data, respond_to })
            .await?
    }

    pub async fn resize(&self, geometry: Geometry) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Resize {
            geometry,
            respond_to,
        })
        .await?
    }

    pub async fn retire(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Retire { respond_to })
            .await?
    }

    /// True once the actor has stopped taking commands.
    pub fn is_retired(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether both handles address the same actor.
    pub fn same_record(&self, other: &SessionHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// Create a record in `stopped` state and start its actor task.
pub fn spawn_session(id: String, params: SpawnParams, ctx: SessionContext) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(32);
    let now = Utc::now();

    let actor = SessionActor {
        id: id.clone(),
        geometry: Geometry {
            cols: ctx.config.default_cols,
            rows: ctx.config.default_rows,
        },
        buffer: OutputRingBuffer::with_capacity(ctx.config.buffer_bytes),
        ctx,
        receiver,
        status: SessionStatus::Stopped,
        params,
        process: None,
        clients: HashMap::new(),
        created_at: now,
        last_active_at: now,
        last_output: Instant::now(),
        exit_info: None,
        stop: None,
    };

    tokio::spawn(actor.run());

    SessionHandle { id, sender }
}

struct LiveProcess {
    control: Arc<dyn PtyControl>,
    events: mpsc::Receiver<PtyEvent>,
    pid: Option<u32>,
}

struct PendingStop {
    deadline: Instant,
    forced: bool,
    waiters: Vec<oneshot::Sender<SessionInfo>>,
}

/// What the actor hands back on attach; the handle side adds itself.
struct Attached {
    client_id: ClientId,
    snapshot: Vec<u8>,
    status: SessionStatus,
    exit_info: Option<ExitInfo>,
    events: mpsc::Receiver<ClientEvent>,
}

/// Owns one session record; the only task that mutates it.
struct SessionActor {
    id: String,
    ctx: SessionContext,
    receiver: mpsc::Receiver<SessionCommand>,
    status: SessionStatus,
    params: SpawnParams,
    process: Option<LiveProcess>,
    buffer: OutputRingBuffer,
    clients: HashMap<ClientId, mpsc::Sender<ClientEvent>>,
    geometry: Geometry,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    last_output: Instant,
    exit_info: Option<ExitInfo>,
    stop: Option<PendingStop>,
}

async fn next_event(process: &mut Option<LiveProcess>) -> Option<PtyEvent> {
    match process {
        Some(process) => process.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self) {
        debug!(session_id = %self.id, "Session actor started");

        loop {
            let idle_deadline = self.idle_deadline();
            let stop_deadline = self.stop.as_ref().map(|stop| stop.deadline);

            tokio::select! {
                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                event = next_event(&mut self.process) => self.handle_pty_event(event),
                _ = sleep_until_some(idle_deadline) => self.mark_idle(),
                _ = sleep_until_some(stop_deadline) => self.escalate_stop(),
            }
        }

        // Only reachable with a live process if every handle was dropped
        if let Some(process) = self.process.take() {
            let _ = process.control.terminate(false);
        }
        debug!(session_id = %self.id, "Session actor finished");
    }

    /// Returns false when the actor should end.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::GetInfo { respond_to } => {
                let _ = respond_to.send(self.info());
            }

            SessionCommand::Start { params, respond_to } => {
                let result = if self.process.is_some() {
                    Err(SessionError::AlreadyRunning(self.id.clone()))
                } else {
                    if let Some(params) = params {
                        self.params = params;
                    }
                    self.start_process().await.map(|()| self.info())
                };
                let _ = respond_to.send(result);
            }

            SessionCommand::Stop { respond_to } => self.begin_stop(respond_to),

            SessionCommand::Attach {
                client_id,
                start_if_stopped,
                geometry,
                respond_to,
            } => {
                let attached = self.attach(client_id, start_if_stopped, geometry).await;
                let _ = respond_to.send(attached);
            }

            SessionCommand::Detach {
                client_id,
                respond_to,
            } => {
                let removed = self.clients.remove(&client_id).is_some();
                if removed {
                    info!(
                        session_id = %self.id,
                        client_id = %client_id,
                        clients = self.clients.len(),
                        "Client detached"
                    );
                }
                let _ = respond_to.send(removed);
            }

            SessionCommand::WriteInput { data, respond_to } => {
                let _ = respond_to.send(self.write_input(data));
            }

            SessionCommand::Resize {
                geometry,
                respond_to,
            } => {
                let _ = respond_to.send(self.resize(geometry));
            }

            SessionCommand::Retire { respond_to } => {
                if self.process.is_some() {
                    let _ = respond_to.send(Err(SessionError::RemoveConflict(self.id.clone())));
                } else {
                    info!(session_id = %self.id, "Session removed");
                    // Handles observe the retirement before the reply lands
                    self.receiver.close();
                    let _ = respond_to.send(Ok(()));
                    return false;
                }
            }
        }
        true
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            status: self.status,
            spawn_params: self.params.clone(),
            pid: self.process.as_ref().and_then(|p| p.pid),
            geometry: self.geometry,
            attached_clients: self.clients.len(),
            created_at: self.created_at,
            last_active_at: self.last_active_at,
            exit_info: self.exit_info.clone(),
        }
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        debug!(session_id = %self.id, from = ?self.status, to = ?status, "Session status changed");
        self.status = status;
        // No subscribers is fine
        let _ = self.ctx.status_tx.send(StatusNotice {
            session_id: self.id.clone(),
            status,
            exit_info: self.exit_info.clone(),
            at: Utc::now(),
        });
    }

    async fn start_process(&mut self) -> Result<(), SessionError> {
        if self.process.is_some() {
            return Err(SessionError::AlreadyRunning(self.id.clone()));
        }

        self.buffer.clear();
        self.exit_info = None;
        self.set_status(SessionStatus::Starting);

        let config = self
            .params
            .to_pty_config(self.geometry.cols, self.geometry.rows);
        info!(
            session_id = %self.id,
            command = %self.params.command,
            cwd = %self.params.cwd,
            "Starting session process"
        );

        // Spawning forks and execs; keep it off the async workers
        let backend = self.ctx.backend.clone();
        let spawned = tokio::task::spawn_blocking(move || backend.spawn(config))
            .await
            .unwrap_or_else(|e| Err(SpawnError::SpawnFailed(format!("spawn task failed: {e}"))));

        match spawned {
            Ok(SpawnedPty { control, events }) => {
                let pid = control.pid();
                self.process = Some(LiveProcess {
                    control,
                    events,
                    pid,
                });
                self.last_output = Instant::now();
                self.last_active_at = Utc::now();
                self.ctx.metrics.session_started();
                self.set_status(SessionStatus::Running);
                self.broadcast(ClientEvent::Started);
                info!(session_id = %self.id, pid = ?pid, "Session process running");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to spawn session process");
                self.ctx.metrics.spawn_error();
                let exit_info = ExitInfo::spawn_failed(&e);
                self.exit_info = Some(exit_info.clone());
                self.set_status(SessionStatus::Error);
                self.broadcast(ClientEvent::Exited(exit_info));
                Err(SessionError::Spawn(e))
            }
        }
    }

    fn begin_stop(&mut self, respond_to: oneshot::Sender<SessionInfo>) {
        let Some(process) = &self.process else {
            let _ = respond_to.send(self.info());
            return;
        };

        if let Some(stop) = self.stop.as_mut() {
            stop.waiters.push(respond_to);
            return;
        }

        info!(session_id = %self.id, pid = ?process.pid, "Stopping session process");
        if let Err(e) = process.control.terminate(true) {
            warn!(session_id = %self.id, error = %e, "Graceful terminate failed");
        }
        self.stop = Some(PendingStop {
            deadline: Instant::now() + self.ctx.config.stop_grace,
            forced: false,
            waiters: vec![respond_to],
        });
    }

    fn escalate_stop(&mut self) {
        let grace = self.ctx.config.stop_grace;
        let Some(stop) = self.stop.as_mut() else {
            return;
        };

        if stop.forced {
            warn!(session_id = %self.id, "Session process survived SIGKILL, abandoning it");
            self.handle_exit(ExitStatus {
                code: None,
                signal: None,
            });
            return;
        }

        stop.forced = true;
        stop.deadline = Instant::now() + grace;
        warn!(
            session_id = %self.id,
            grace_ms = grace.as_millis() as u64,
            "Session process ignored SIGTERM, killing"
        );
        if let Some(process) = &self.process {
            if let Err(e) = process.control.terminate(false) {
                warn!(session_id = %self.id, error = %e, "Forceful terminate failed");
            }
        }
    }

    async fn attach(
        &mut self,
        client_id: ClientId,
        start_if_stopped: bool,
        geometry: Option<Geometry>,
    ) -> Attached {
        if let Some(geometry) = geometry {
            self.geometry = geometry;
            if let Some(process) = &self.process {
                if let Err(e) = process.control.resize(geometry.cols, geometry.rows) {
                    debug!(session_id = %self.id, error = %e, "Resize on attach failed");
                }
            }
        }

        if start_if_stopped && self.process.is_none() {
            // A spawn failure is reported through status and exit_info
            let _ = self.start_process().await;
        }

        let (tx, rx) = mpsc::channel(self.ctx.config.client_queue_capacity);
        if self.clients.insert(client_id.clone(), tx).is_some() {
            debug!(session_id = %self.id, client_id = %client_id, "Replaced existing attachment");
        }
        info!(
            session_id = %self.id,
            client_id = %client_id,
            clients = self.clients.len(),
            status = ?self.status,
            "Client attached"
        );

        Attached {
            client_id,
            snapshot: self.buffer.snapshot(),
            status: self.status,
            exit_info: if self.status.is_live() {
                None
            } else {
                self.exit_info.clone()
            },
            events: rx,
        }
    }

    fn write_input(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
        let Some(process) = &self.process else {
            return Err(SessionError::NotRunning(self.id.clone()));
        };
        match process.control.write(data) {
            Ok(()) => {
                self.last_active_at = Utc::now();
                self.ctx.metrics.input_message();
                Ok(())
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "Input rejected");
                Err(SessionError::NotRunning(self.id.clone()))
            }
        }
    }

    fn resize(&mut self, geometry: Geometry) -> Result<(), SessionError> {
        let Some(process) = &self.process else {
            return Err(SessionError::NotRunning(self.id.clone()));
        };
        match process.control.resize(geometry.cols, geometry.rows) {
            Ok(()) => {}
            Err(PtyError::ProcessExited) => {
                return Err(SessionError::NotRunning(self.id.clone()));
            }
            Err(e) => warn!(session_id = %self.id, error = %e, "PTY resize failed"),
        }
        self.geometry = geometry;
        Ok(())
    }

    fn handle_pty_event(&mut self, event: Option<PtyEvent>) {
        match event {
            Some(PtyEvent::Output(data)) => self.handle_output(data),
            Some(PtyEvent::Exited(status)) => self.handle_exit(status),
            None => {
                warn!(session_id = %self.id, "PTY event stream closed without an exit status");
                self.handle_exit(ExitStatus {
                    code: None,
                    signal: None,
                });
            }
        }
    }

    fn handle_output(&mut self, data: Vec<u8>) {
        self.buffer.append(&data);
        self.last_output = Instant::now();
        self.last_active_at = Utc::now();
        if self.status == SessionStatus::Idle {
            self.set_status(SessionStatus::Running);
        }
        self.broadcast(ClientEvent::Output(data));
    }

    fn handle_exit(&mut self, status: ExitStatus) {
        let pid = self.process.take().and_then(|p| p.pid);
        let stop = self.stop.take();

        let (next, exit_info) = if stop.is_some() {
            (SessionStatus::Stopped, ExitInfo::stopped(&status))
        } else if status.success() {
            (SessionStatus::Exited, ExitInfo::from_status(&status))
        } else {
            (SessionStatus::Error, ExitInfo::from_status(&status))
        };

        info!(
            session_id = %self.id,
            pid = ?pid,
            status = ?next,
            reason = %exit_info.reason,
            "Session process ended"
        );

        self.exit_info = Some(exit_info.clone());
        self.set_status(next);
        self.broadcast(ClientEvent::Exited(exit_info));

        if let Some(stop) = stop {
            let info = self.info();
            for waiter in stop.waiters {
                let _ = waiter.send(info.clone());
            }
        }
    }

    fn idle_deadline(&self) -> Option<Instant> {
        (self.status == SessionStatus::Running && self.stop.is_none())
            .then(|| self.last_output + self.ctx.config.idle_after)
    }

    fn mark_idle(&mut self) {
        if self.status == SessionStatus::Running {
            self.set_status(SessionStatus::Idle);
        }
    }

    /// Deliver to every attached client without waiting on any of them.
    ///
    /// A client whose queue is full is evicted rather than skipped, so every
    /// attached client sees a gapless stream. Its queue closes once drained.
    fn broadcast(&mut self, event: ClientEvent) {
        if self.clients.is_empty() {
            return;
        }

        let mut evicted = Vec::new();
        let mut disconnected = Vec::new();

        for (client_id, tx) in &self.clients {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => evicted.push(client_id.clone()),
                Err(TrySendError::Closed(_)) => disconnected.push(client_id.clone()),
            }
        }

        for client_id in disconnected {
            self.clients.remove(&client_id);
            debug!(session_id = %self.id, client_id = %client_id, "Dropped disconnected client");
        }
        for client_id in evicted {
            self.clients.remove(&client_id);
            self.ctx.metrics.output_dropped();
            self.ctx.metrics.client_evicted();
            warn!(
                session_id = %self.id,
                client_id = %client_id,
                capacity = self.ctx.config.client_queue_capacity,
                "Evicted client that stopped reading"
            );
        }
    }
}
