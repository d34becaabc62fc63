//! Periodic refresh of the two polled resources. The session list refetches
//! unconditionally; the thread only while a session is selected. A manual
//! refresh runs sessions first and awaits the thread fetch afterwards so it
//! can never race a stale selection.

use crate::gateway::{Gateway, GatewayError};
use convo_core::{ChatMessage, SessionSummary, Tenant};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const THREAD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What the poller is currently responsible for. The app loop publishes a
/// new target whenever tenant or selection changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTarget {
    pub tenant: Tenant,
    pub session: Option<String>,
}

#[derive(Debug)]
pub enum PollCommand {
    Refresh,
    Export {
        tenant: Tenant,
        session: Option<String>,
    },
}

#[derive(Debug)]
pub enum PollUpdate {
    Sessions {
        tenant: Tenant,
        result: Result<Vec<SessionSummary>, GatewayError>,
    },
    Thread {
        tenant: Tenant,
        session_id: String,
        result: Result<Vec<ChatMessage>, GatewayError>,
    },
    ExportDone {
        result: Result<String, GatewayError>,
    },
}

pub async fn run_poller(
    gateway: Arc<Gateway>,
    mut target_rx: watch::Receiver<PollTarget>,
    mut commands: mpsc::Receiver<PollCommand>,
    updates: mpsc::Sender<PollUpdate>,
    export_dir: PathBuf,
) {
    let mut session_ticker = tokio::time::interval(SESSION_POLL_INTERVAL);
    let mut thread_ticker = tokio::time::interval(THREAD_POLL_INTERVAL);
    let mut last_target = target_rx.borrow().clone();

    loop {
        tokio::select! {
            _ = session_ticker.tick() => {
                let tenant = target_rx.borrow().tenant;
                poll_sessions(&gateway, tenant, &updates).await;
            }
            _ = thread_ticker.tick() => {
                let target = target_rx.borrow().clone();
                // Suspended while nothing is selected.
                if let Some(session_id) = target.session {
                    poll_thread(&gateway, target.tenant, &session_id, &updates).await;
                }
            }
            changed = target_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let target = target_rx.borrow_and_update().clone();
                let tenant_changed = target.tenant != last_target.tenant;
                let session_changed = target.session != last_target.session;
                last_target = target.clone();
                // A new tenant or selection gets fresh data now, not at the
                // next tick.
                if tenant_changed {
                    poll_sessions(&gateway, target.tenant, &updates).await;
                }
                if tenant_changed || session_changed {
                    if let Some(session_id) = target.session {
                        poll_thread(&gateway, target.tenant, &session_id, &updates).await;
                    }
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    return;
                };
                match command {
                    PollCommand::Refresh => {
                        let tenant = target_rx.borrow().tenant;
                        poll_sessions(&gateway, tenant, &updates).await;
                        // Selection is re-read after the session fetch
                        // resolved, so the thread fetch cannot use a target
                        // the refresh itself just invalidated.
                        let target = target_rx.borrow().clone();
                        if let Some(session_id) = target.session {
                            poll_thread(&gateway, target.tenant, &session_id, &updates).await;
                        }
                    }
                    PollCommand::Export { tenant, session } => {
                        let result = run_export(&gateway, tenant, session.as_deref(), &export_dir).await;
                        let _ = updates.send(PollUpdate::ExportDone { result }).await;
                    }
                }
            }
        }
    }
}

async fn poll_sessions(gateway: &Gateway, tenant: Tenant, updates: &mpsc::Sender<PollUpdate>) {
    let result = gateway.fetch_sessions(tenant).await;
    if let Err(err) = &result {
        warn!(event = "sessions_poll_error", tenant = %tenant, error = %err);
    }
    let _ = updates.send(PollUpdate::Sessions { tenant, result }).await;
}

async fn poll_thread(
    gateway: &Gateway,
    tenant: Tenant,
    session_id: &str,
    updates: &mpsc::Sender<PollUpdate>,
) {
    let result = gateway.fetch_messages(session_id, tenant).await;
    if let Err(err) = &result {
        warn!(event = "thread_poll_error", tenant = %tenant, session_id = %session_id, error = %err);
    }
    let _ = updates
        .send(PollUpdate::Thread {
            tenant,
            session_id: session_id.to_string(),
            result,
        })
        .await;
}

async fn run_export(
    gateway: &Gateway,
    tenant: Tenant,
    session: Option<&str>,
    export_dir: &Path,
) -> Result<String, GatewayError> {
    let (filename, bytes) = gateway.export_csv(tenant, session).await?;
    let path = export_dir.join(&filename);
    std::fs::write(&path, &bytes)
        .map_err(|err| GatewayError::Export(format!("could not write {}: {err}", path.display())))?;
    info!(event = "export_written", path = %path.display(), bytes = bytes.len());
    Ok(path.display().to_string())
}
