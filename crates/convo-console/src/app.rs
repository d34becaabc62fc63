//! Application state. The app loop is the cache actor: poll results and
//! push events arrive as messages and are applied here, in arrival order,
//! by a single writer.

use crate::cache::ChatCache;
use crate::poller::{PollTarget, PollUpdate};
use crate::selection::SessionSelector;
use crate::subscription::RelayEvent;
use convo_core::{ChatMessage, SessionSummary, Tenant};
use std::sync::Arc;
use tracing::info;

pub struct App {
    tenant: Tenant,
    cache: ChatCache,
    selector: SessionSelector,
    pub filter: String,
    pub filter_input: bool,
    push_connected: bool,
    push_fallback: bool,
    pub sessions_error: Option<String>,
    pub thread_error: Option<String>,
    pub status_note: Option<String>,
    pub export_alert: Option<String>,
    pub should_quit: bool,
}

impl App {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            cache: ChatCache::default(),
            selector: SessionSelector::default(),
            filter: String::new(),
            filter_input: false,
            push_connected: false,
            push_fallback: false,
            sessions_error: None,
            thread_error: None,
            status_note: None,
            export_alert: None,
            should_quit: false,
        }
    }

    pub fn tenant(&self) -> Tenant {
        self.tenant
    }

    /// Tenant switch clears the manual pick so the new tenant reselects its
    /// own most-recent session. Cached entries for the old tenant stay put.
    pub fn set_tenant(&mut self, tenant: Tenant) {
        if tenant == self.tenant {
            return;
        }
        self.tenant = tenant;
        self.selector.clear();
        self.sessions_error = None;
        self.thread_error = None;
        self.status_note = Some(format!("viewing {}", tenant.label()));
    }

    pub fn toggle_tenant(&mut self) {
        self.set_tenant(self.tenant.other());
    }

    pub fn sessions(&self) -> Option<&[SessionSummary]> {
        self.cache.sessions(self.tenant)
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.selector
            .active(self.cache.sessions(self.tenant))
            .map(str::to_string)
    }

    pub fn active_thread(&self) -> Option<&Arc<Vec<ChatMessage>>> {
        let active = self.selector.active(self.cache.sessions(self.tenant))?;
        let active = active.to_string();
        self.cache.thread(self.tenant, &active)
    }

    pub fn poll_target(&self) -> PollTarget {
        PollTarget {
            tenant: self.tenant,
            session: self.active_session_id(),
        }
    }

    pub fn select_session(&mut self, session_id: &str) {
        self.selector.set_manual(session_id);
        self.thread_error = None;
    }

    /// Sessions visible in the sidebar: substring filter over id and last
    /// message, case-insensitive.
    pub fn filtered_sessions(&self) -> Vec<&SessionSummary> {
        let sessions = match self.cache.sessions(self.tenant) {
            Some(sessions) => sessions,
            None => return Vec::new(),
        };
        if self.filter.trim().is_empty() {
            return sessions.iter().collect();
        }
        let lowered = self.filter.to_lowercase();
        sessions
            .iter()
            .filter(|session| {
                session.session_id.to_lowercase().contains(&lowered)
                    || session.last_message.to_lowercase().contains(&lowered)
            })
            .collect()
    }

    /// Step the selection through the filtered list and pin it manually.
    pub fn move_selection(&mut self, step: i32) {
        let active = self.active_session_id();
        let filtered = self.filtered_sessions();
        if filtered.is_empty() {
            return;
        }
        let current = active
            .as_deref()
            .and_then(|id| filtered.iter().position(|s| s.session_id == id))
            .unwrap_or(0);
        let max = filtered.len().saturating_sub(1) as i32;
        let next = (current as i32 + step).clamp(0, max) as usize;
        let next_id = filtered[next].session_id.clone();
        self.select_session(&next_id);
    }

    pub fn apply_poll(&mut self, update: PollUpdate) {
        match update {
            PollUpdate::Sessions { tenant, result } => match result {
                Ok(sessions) => {
                    // Results land in the cache under their own tenant even
                    // when the view moved on; they are simply not rendered.
                    self.cache.replace_sessions(tenant, sessions);
                    if tenant == self.tenant {
                        self.sessions_error = None;
                    }
                }
                Err(err) => {
                    if tenant == self.tenant {
                        self.sessions_error = Some(err.to_string());
                    }
                }
            },
            PollUpdate::Thread {
                tenant,
                session_id,
                result,
            } => {
                let is_active = tenant == self.tenant
                    && self.active_session_id().as_deref() == Some(session_id.as_str());
                match result {
                    Ok(messages) => {
                        self.cache.replace_thread(tenant, &session_id, messages);
                        if is_active {
                            self.thread_error = None;
                        }
                    }
                    Err(err) => {
                        if is_active {
                            self.thread_error = Some(err.to_string());
                        }
                    }
                }
            }
            PollUpdate::ExportDone { result } => match result {
                Ok(path) => {
                    self.status_note = Some(format!("exported {path}"));
                }
                Err(err) => {
                    // Blocking alert; cached state is untouched.
                    self.export_alert = Some(err.to_string());
                }
            },
        }
    }

    pub fn apply_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => {
                self.push_connected = true;
                self.push_fallback = false;
            }
            RelayEvent::Disconnected => {
                self.push_connected = false;
            }
            RelayEvent::GaveUp => {
                self.push_connected = false;
                self.push_fallback = true;
            }
            RelayEvent::NewMessage(payload) => {
                // The selection as of before this event decides whether the
                // thread gets the message; the summary merge must not widen
                // it first.
                let active = self.active_session_id();
                self.cache.merge_session(self.tenant, payload.to_summary());
                if active.as_deref() == Some(payload.session_id.as_str()) {
                    let appended = self.cache.append_message(self.tenant, payload.to_message());
                    if appended {
                        info!(event = "push_message_applied", session_id = %payload.session_id);
                    }
                }
            }
        }
    }

    pub fn push_connected(&self) -> bool {
        self.push_connected
    }

    pub fn push_status_label(&self) -> &'static str {
        if self.push_connected {
            "live"
        } else if self.push_fallback {
            "fallback"
        } else {
            "connecting"
        }
    }

    pub fn dismiss_alert(&mut self) {
        self.export_alert = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use chrono::{DateTime, TimeZone, Utc};
    use convo_core::{NewMessagePayload, Role};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap()
    }

    fn summary(id: &str, secs: i64) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            last_message: format!("last of {id}"),
            last_message_at: ts(secs),
        }
    }

    fn message(session_id: &str, id: i64, secs: i64) -> ChatMessage {
        ChatMessage {
            id,
            session_id: session_id.to_string(),
            role: Role::Human,
            content: "hello".to_string(),
            created_at: ts(secs),
        }
    }

    fn push_payload(session_id: &str, id: i64, secs: i64) -> NewMessagePayload {
        convo_core::parse_new_message(&serde_json::json!({
            "session_id": session_id,
            "message": { "type": "ai", "content": "pushed" },
            "created_at": ts(secs).to_rfc3339(),
            "id": id
        }))
        .expect("valid payload")
    }

    fn app_with_sessions(sessions: Vec<SessionSummary>) -> App {
        let mut app = App::new(Tenant::AlAzhar);
        app.apply_poll(PollUpdate::Sessions {
            tenant: Tenant::AlAzhar,
            result: Ok(sessions),
        });
        app
    }

    #[test]
    fn push_for_inactive_session_updates_list_but_not_thread() {
        let mut app = app_with_sessions(vec![summary("S2", 50)]);
        app.apply_poll(PollUpdate::Thread {
            tenant: Tenant::AlAzhar,
            session_id: "S2".to_string(),
            result: Ok(vec![message("S2", 1, 10)]),
        });
        assert_eq!(app.active_session_id().as_deref(), Some("S2"));

        app.apply_relay(RelayEvent::NewMessage(push_payload("S1", 9, 99)));

        let sessions = app.sessions().unwrap();
        assert_eq!(sessions[0].session_id, "S1");
        assert_eq!(sessions.len(), 2);
        // S1 gained no thread entry; it only got a summary.
        app.select_session("S1");
        assert!(app.active_thread().is_none());
        // S2's cached thread is untouched.
        app.select_session("S2");
        assert_eq!(app.active_thread().unwrap().len(), 1);
        assert_eq!(app.active_thread().unwrap()[0].id, 1);
    }

    #[test]
    fn push_for_active_session_appends_to_thread() {
        let mut app = app_with_sessions(vec![summary("S2", 50)]);
        app.apply_poll(PollUpdate::Thread {
            tenant: Tenant::AlAzhar,
            session_id: "S2".to_string(),
            result: Ok(vec![message("S2", 1, 10)]),
        });

        app.apply_relay(RelayEvent::NewMessage(push_payload("S2", 2, 60)));
        let thread = app.active_thread().unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[1].id, 2);

        // Same event again is a no-op.
        app.apply_relay(RelayEvent::NewMessage(push_payload("S2", 2, 60)));
        assert_eq!(app.active_thread().unwrap().len(), 2);
    }

    #[test]
    fn tenant_switch_clears_manual_override() {
        let mut app = app_with_sessions(vec![summary("A", 5), summary("X", 3)]);
        app.select_session("X");
        assert_eq!(app.active_session_id().as_deref(), Some("X"));

        app.set_tenant(Tenant::Lestari);
        app.apply_poll(PollUpdate::Sessions {
            tenant: Tenant::Lestari,
            result: Ok(vec![summary("L1", 9), summary("X", 1)]),
        });
        // Most recent of the new tenant, not the old pick.
        assert_eq!(app.active_session_id().as_deref(), Some("L1"));
    }

    #[test]
    fn poll_errors_scope_to_the_current_tenant() {
        let mut app = app_with_sessions(vec![summary("A", 5)]);
        app.apply_poll(PollUpdate::Sessions {
            tenant: Tenant::Lestari,
            result: Err(GatewayError::Remote("Unable to fetch sessions.".into())),
        });
        assert!(app.sessions_error.is_none());

        app.apply_poll(PollUpdate::Sessions {
            tenant: Tenant::AlAzhar,
            result: Err(GatewayError::Remote("Unable to fetch sessions.".into())),
        });
        assert_eq!(
            app.sessions_error.as_deref(),
            Some("Unable to fetch sessions.")
        );
        // The failed poll leaves the cached list alone.
        assert_eq!(app.sessions().unwrap().len(), 1);
    }

    #[test]
    fn stale_tenant_results_still_land_in_cache() {
        let mut app = App::new(Tenant::AlAzhar);
        app.apply_poll(PollUpdate::Sessions {
            tenant: Tenant::Lestari,
            result: Ok(vec![summary("L1", 1)]),
        });
        assert!(app.sessions().is_none());

        app.set_tenant(Tenant::Lestari);
        assert_eq!(app.sessions().unwrap().len(), 1);
    }

    #[test]
    fn export_failure_raises_blocking_alert_and_leaves_state() {
        let mut app = app_with_sessions(vec![summary("A", 5)]);
        app.apply_poll(PollUpdate::ExportDone {
            result: Err(GatewayError::Export("Unable to export chats.".into())),
        });
        assert_eq!(app.export_alert.as_deref(), Some("Unable to export chats."));
        assert_eq!(app.sessions().unwrap().len(), 1);

        app.dismiss_alert();
        assert!(app.export_alert.is_none());
    }

    #[test]
    fn push_status_reflects_lifecycle() {
        let mut app = App::new(Tenant::AlAzhar);
        assert_eq!(app.push_status_label(), "connecting");
        app.apply_relay(RelayEvent::Connected);
        assert_eq!(app.push_status_label(), "live");
        app.apply_relay(RelayEvent::Disconnected);
        assert_eq!(app.push_status_label(), "connecting");
        app.apply_relay(RelayEvent::GaveUp);
        assert_eq!(app.push_status_label(), "fallback");
        assert!(!app.push_connected());
    }

    #[test]
    fn filter_narrows_sidebar_without_touching_cache() {
        let mut app = app_with_sessions(vec![
            summary("wa-628123", 5),
            summary("wa-627999", 4),
            summary("tg-100", 3),
        ]);
        app.filter = "wa-".to_string();
        assert_eq!(app.filtered_sessions().len(), 2);
        app.filter = "LAST OF TG".to_string();
        assert_eq!(app.filtered_sessions().len(), 1);
        app.filter.clear();
        assert_eq!(app.filtered_sessions().len(), 3);
    }

    #[test]
    fn move_selection_walks_the_filtered_list() {
        let mut app = app_with_sessions(vec![summary("a", 5), summary("b", 4), summary("c", 3)]);
        assert_eq!(app.active_session_id().as_deref(), Some("a"));
        app.move_selection(1);
        assert_eq!(app.active_session_id().as_deref(), Some("b"));
        app.move_selection(5);
        assert_eq!(app.active_session_id().as_deref(), Some("c"));
        app.move_selection(-1);
        assert_eq!(app.active_session_id().as_deref(), Some("b"));
    }
}
