//! Client-side cache keyed by `(resource, tenant, [session])`. The app loop
//! is the only writer: the poller replaces entries wholesale, push events
//! merge through the reconcile functions. Entries survive tenant switches;
//! a different tenant is simply a different key.

use crate::reconcile::{append_message, merge_session};
use convo_core::{ChatMessage, SessionSummary, Tenant};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ChatCache {
    sessions: HashMap<Tenant, Vec<SessionSummary>>,
    threads: HashMap<(Tenant, String), Arc<Vec<ChatMessage>>>,
}

impl ChatCache {
    pub fn sessions(&self, tenant: Tenant) -> Option<&[SessionSummary]> {
        self.sessions.get(&tenant).map(Vec::as_slice)
    }

    pub fn thread(&self, tenant: Tenant, session_id: &str) -> Option<&Arc<Vec<ChatMessage>>> {
        self.threads.get(&(tenant, session_id.to_string()))
    }

    /// Poll result: the list for this tenant is replaced wholesale.
    pub fn replace_sessions(&mut self, tenant: Tenant, sessions: Vec<SessionSummary>) {
        self.sessions.insert(tenant, sessions);
    }

    /// Poll result: the full thread replaces whatever was cached, including
    /// pushed-but-not-yet-persisted messages (accepted inconsistency window).
    pub fn replace_thread(&mut self, tenant: Tenant, session_id: &str, messages: Vec<ChatMessage>) {
        self.threads
            .insert((tenant, session_id.to_string()), Arc::new(messages));
    }

    /// Push event: upsert one summary into this tenant's list. An absent
    /// list becomes a single-entry list.
    pub fn merge_session(&mut self, tenant: Tenant, incoming: SessionSummary) {
        let merged = match self.sessions.get(&tenant) {
            Some(existing) => merge_session(existing, incoming),
            None => vec![incoming],
        };
        self.sessions.insert(tenant, merged);
    }

    /// Push event: append one message to a cached thread. Returns false when
    /// the message was already present and nothing changed.
    pub fn append_message(&mut self, tenant: Tenant, incoming: ChatMessage) -> bool {
        let key = (tenant, incoming.session_id.clone());
        let next = append_message(self.threads.get(&key), incoming);
        let changed = self
            .threads
            .get(&key)
            .map(|current| !Arc::ptr_eq(current, &next))
            .unwrap_or(true);
        self.threads.insert(key, next);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_core::Role;

    fn summary(id: &str, secs: i64) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            last_message: "hi".to_string(),
            last_message_at: Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap(),
        }
    }

    fn message(session_id: &str, id: i64, secs: i64) -> ChatMessage {
        ChatMessage {
            id,
            session_id: session_id.to_string(),
            role: Role::Ai,
            content: "hi".to_string(),
            created_at: Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn tenants_have_independent_entries() {
        let mut cache = ChatCache::default();
        cache.replace_sessions(Tenant::AlAzhar, vec![summary("a", 0)]);
        cache.replace_sessions(Tenant::Lestari, vec![summary("x", 0), summary("y", 1)]);

        assert_eq!(cache.sessions(Tenant::AlAzhar).unwrap().len(), 1);
        assert_eq!(cache.sessions(Tenant::Lestari).unwrap().len(), 2);
    }

    #[test]
    fn merge_into_absent_list_creates_it() {
        let mut cache = ChatCache::default();
        cache.merge_session(Tenant::AlAzhar, summary("a", 0));
        assert_eq!(cache.sessions(Tenant::AlAzhar).unwrap().len(), 1);
        assert!(cache.sessions(Tenant::Lestari).is_none());
    }

    #[test]
    fn poll_replacement_wins_over_earlier_pushes() {
        let mut cache = ChatCache::default();
        cache.append_message(Tenant::AlAzhar, message("s-1", 7, 70));
        cache.replace_thread(Tenant::AlAzhar, "s-1", vec![message("s-1", 1, 10)]);

        let thread = cache.thread(Tenant::AlAzhar, "s-1").unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, 1);
    }

    #[test]
    fn append_reports_whether_anything_changed() {
        let mut cache = ChatCache::default();
        assert!(cache.append_message(Tenant::AlAzhar, message("s-1", 1, 0)));
        assert!(cache.append_message(Tenant::AlAzhar, message("s-1", 2, 5)));
        assert!(!cache.append_message(Tenant::AlAzhar, message("s-1", 2, 5)));
        assert_eq!(cache.thread(Tenant::AlAzhar, "s-1").unwrap().len(), 2);
    }
}
