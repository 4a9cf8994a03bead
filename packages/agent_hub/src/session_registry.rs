use futures::future::join_all;
use pty_manager::PtyBackend;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::config::{AttachPolicy, SessionConfig};
use crate::error::SessionError;
use crate::metrics::ServerMetrics;
use crate::params::SpawnParams;
use crate::session_actor::{
    Attachment, ClientId, Geometry, SessionContext, SessionHandle, SessionInfo, StatusNotice,
    spawn_session,
};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Single source of truth for session records, shared by the REST layer
/// and the front door.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Which session each client is attached to
    bindings: Mutex<HashMap<ClientId, String>>,
    ctx: SessionContext,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn PtyBackend>,
        config: SessionConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            ctx: SessionContext {
                backend,
                config: Arc::new(config),
                metrics,
                status_tx,
            },
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.ctx.metrics.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Status transitions of every session, from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusNotice> {
        self.ctx.status_tx.subscribe()
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Returns the handle and whether the record was just created.
    async fn get_or_create(&self, session_id: &str, params: SpawnParams) -> (SessionHandle, bool) {
        let mut sessions = self.sessions.write().await;
        // A retired handle still in the map belongs to a remove in progress
        if let Some(handle) = sessions.get(session_id).filter(|h| !h.is_retired()) {
            return (handle.clone(), false);
        }
        debug!(session_id = %session_id, "Creating session record");
        let handle = spawn_session(session_id.to_string(), params, self.ctx.clone());
        sessions.insert(session_id.to_string(), handle.clone());
        (handle, true)
    }

    /// Start a session, creating the record if needed.
    pub async fn start(
        &self,
        session_id: &str,
        params: SpawnParams,
    ) -> Result<SessionInfo, SessionError> {
        let (handle, _) = self.get_or_create(session_id, params.clone()).await;
        handle.start(Some(params)).await
    }

    pub async fn stop(&self, session_id: &str) -> Result<SessionInfo, SessionError> {
        self.handle(session_id).await?.stop().await
    }

    /// Stop then start, optionally with amended params.
    pub async fn restart(
        &self,
        session_id: &str,
        params: Option<SpawnParams>,
    ) -> Result<SessionInfo, SessionError> {
        let handle = self.handle(session_id).await?;
        handle.stop().await?;
        handle.start(params).await
    }

    /// Attach a client, creating and starting the record if it does not exist.
    ///
    /// `params_if_absent` is required only for a record that does not exist
    /// yet. A client already attached elsewhere is detached from there first.
    pub async fn attach(
        &self,
        session_id: &str,
        client_id: ClientId,
        params_if_absent: Option<SpawnParams>,
        geometry: Option<Geometry>,
    ) -> Result<Attachment, SessionError> {
        let previous = self.bindings.lock().await.get(&client_id).cloned();
        if let Some(previous) = previous.filter(|p| p != session_id) {
            if let Err(e) = self.detach(&previous, &client_id).await {
                debug!(client_id = %client_id, error = %e, "Previous attachment already gone");
            }
        }

        let (handle, created) = match params_if_absent {
            Some(params) => self.get_or_create(session_id, params).await,
            None => (self.handle(session_id).await?, false),
        };
        let start_if_stopped =
            created || self.ctx.config.attach_policy == AttachPolicy::EnsureRunning;

        let attachment = handle
            .attach(client_id.clone(), start_if_stopped, geometry)
            .await?;
        self.bindings
            .lock()
            .await
            .insert(client_id, session_id.to_string());
        Ok(attachment)
    }

    pub async fn detach(&self, session_id: &str, client_id: &str) -> Result<(), SessionError> {
        {
            let mut bindings = self.bindings.lock().await;
            if bindings.get(client_id).map(String::as_str) == Some(session_id) {
                bindings.remove(client_id);
            }
        }
        self.handle(session_id)
            .await?
            .detach(client_id.to_string())
            .await?;
        Ok(())
    }

    pub async fn write(&self, session_id: &str, data: Vec<u8>) -> Result<(), SessionError> {
        self.handle(session_id).await?.write_input(data).await
    }

    /// Last writer wins across all clients of a session.
    pub async fn resize(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        self.handle(session_id)
            .await?
            .resize(Geometry { cols, rows })
            .await
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.handle(session_id).await.ok()?.info().await.ok()
    }

    pub async fn list_statuses(&self) -> BTreeMap<String, SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        join_all(handles.iter().map(|h| h.info()))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .map(|info| (info.id.clone(), info))
            .collect()
    }

    /// Destroy a record that has no live process.
    ///
    /// The map lock is not held while the record answers, so a busy record
    /// never stalls lookups for other sessions.
    pub async fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self.handle(session_id).await?;
        handle.retire().await?;

        {
            let mut sessions = self.sessions.write().await;
            // A concurrent attach may already have replaced the retired record
            if sessions
                .get(session_id)
                .is_some_and(|current| current.same_record(&handle))
            {
                sessions.remove(session_id);
            }
        }

        self.bindings
            .lock()
            .await
            .retain(|_, bound| bound != session_id);
        info!(session_id = %session_id, "Session record destroyed");
        Ok(())
    }

    /// Stop every live session; used on server shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        info!(sessions = handles.len(), "Stopping all sessions");
        for result in join_all(handles.iter().map(|h| h.stop())).await {
            if let Err(e) = result {
                warn!(error = %e, "Failed to stop session during shutdown");
            }
        }
    }
}
