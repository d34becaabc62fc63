//! Pure merge operations applied to the client-side cache. Poll responses
//! replace entries wholesale; push events go through these two functions.

use convo_core::{ChatMessage, SessionSummary};
use std::sync::Arc;

/// Upsert one session summary into the inbox list: any previous entry with
/// the same id is dropped, the incoming one wins, and the list is re-sorted
/// newest-first. Applying the same summary twice yields the same list.
pub fn merge_session(existing: &[SessionSummary], incoming: SessionSummary) -> Vec<SessionSummary> {
    let mut merged: Vec<SessionSummary> = Vec::with_capacity(existing.len() + 1);
    merged.push(incoming);
    let incoming_id = merged[0].session_id.clone();
    merged.extend(
        existing
            .iter()
            .filter(|session| session.session_id != incoming_id)
            .cloned(),
    );
    merged.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    merged
}

/// Append one pushed message to a cached thread. An absent thread becomes a
/// single-element thread. A duplicate id returns the SAME allocation
/// (`Arc::ptr_eq` with the input) so downstream consumers can treat it as a
/// no-op. Out-of-order arrivals are re-sorted by creation time; this is the
/// only place duplicate suppression happens.
pub fn append_message(
    existing: Option<&Arc<Vec<ChatMessage>>>,
    incoming: ChatMessage,
) -> Arc<Vec<ChatMessage>> {
    let Some(existing) = existing else {
        return Arc::new(vec![incoming]);
    };

    if existing.iter().any(|message| message.id == incoming.id) {
        return Arc::clone(existing);
    }

    let mut appended = existing.as_ref().clone();
    appended.push(incoming);
    appended.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Arc::new(appended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use convo_core::Role;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap()
    }

    fn summary(id: &str, secs: i64) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            last_message: format!("last from {id}"),
            last_message_at: ts(secs),
        }
    }

    fn message(id: i64, secs: i64) -> ChatMessage {
        ChatMessage {
            id,
            session_id: "s-1".to_string(),
            role: Role::Human,
            content: format!("message {id}"),
            created_at: ts(secs),
        }
    }

    fn ids(sessions: &[SessionSummary]) -> Vec<&str> {
        sessions.iter().map(|s| s.session_id.as_str()).collect()
    }

    #[test]
    fn merge_session_upserts_and_sorts_descending() {
        let existing = vec![summary("a", 50), summary("b", 30)];

        let merged = merge_session(&existing, summary("c", 40));
        assert_eq!(ids(&merged), vec!["a", "c", "b"]);

        let merged = merge_session(&merged, summary("b", 60));
        assert_eq!(ids(&merged), vec!["b", "a", "c"]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn merge_session_replaces_existing_entry_without_growing() {
        let existing = vec![summary("a", 50), summary("b", 30)];
        let merged = merge_session(&existing, summary("a", 55));
        assert_eq!(merged.len(), existing.len());
        assert_eq!(merged[0].last_message_at, ts(55));
    }

    #[test]
    fn merge_session_is_idempotent() {
        let existing = vec![summary("a", 50), summary("b", 30)];
        let incoming = summary("c", 40);

        let once = merge_session(&existing, incoming.clone());
        let twice = merge_session(&once, incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn append_message_starts_a_thread_when_absent() {
        let thread = append_message(None, message(1, 0));
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].id, 1);
    }

    #[test]
    fn append_message_keeps_ascending_order_for_late_arrivals() {
        let thread = append_message(None, message(2, 20));
        let thread = append_message(Some(&thread), message(3, 30));
        // Earlier timestamp than the current tail still sorts into place.
        let thread = append_message(Some(&thread), message(1, 10));

        let order: Vec<i64> = thread.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn append_message_duplicate_id_is_a_pointer_stable_noop() {
        let thread = append_message(None, message(1, 0));
        let thread = append_message(Some(&thread), message(2, 10));

        let unchanged = append_message(Some(&thread), message(2, 99));
        assert!(Arc::ptr_eq(&thread, &unchanged));
        assert_eq!(unchanged.len(), 2);
        // Content of the first write wins; the duplicate is ignored entirely.
        assert_eq!(unchanged[1].created_at, ts(10));
    }

    #[test]
    fn append_message_never_duplicates_ids() {
        let mut thread = append_message(None, message(1, 0));
        for _ in 0..3 {
            thread = append_message(Some(&thread), message(1, 0));
        }
        assert_eq!(thread.len(), 1);
    }
}
