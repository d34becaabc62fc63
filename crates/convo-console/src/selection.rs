//! Which session is active: a pure projection of the polled list plus a
//! manual override, recomputed on every change of either input.

use convo_core::SessionSummary;

/// Holds the operator's manual pick. The override survives list refreshes
/// but is cleared on tenant switch so a session id from one tenant never
/// leaks into the other's view.
#[derive(Debug, Default)]
pub struct SessionSelector {
    manual: Option<String>,
}

impl SessionSelector {
    pub fn set_manual(&mut self, session_id: &str) {
        self.manual = Some(session_id.to_string());
    }

    pub fn clear(&mut self) {
        self.manual = None;
    }

    pub fn manual(&self) -> Option<&str> {
        self.manual.as_deref()
    }

    /// Empty or absent list: nothing is active. A manual pick that is still
    /// in the list wins; a vanished pick falls back to the most recent entry.
    pub fn active<'a>(&self, sessions: Option<&'a [SessionSummary]>) -> Option<&'a str> {
        let sessions = sessions?;
        if sessions.is_empty() {
            return None;
        }
        if let Some(manual) = self.manual.as_deref() {
            if let Some(found) = sessions
                .iter()
                .find(|session| session.session_id == manual)
            {
                return Some(found.session_id.as_str());
            }
        }
        Some(sessions[0].session_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn summary(id: &str, secs: i64) -> SessionSummary {
        SessionSummary {
            session_id: id.to_string(),
            last_message: String::new(),
            last_message_at: Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn no_sessions_means_no_active_session() {
        let selector = SessionSelector::default();
        assert_eq!(selector.active(None), None);
        assert_eq!(selector.active(Some(&[])), None);
    }

    #[test]
    fn defaults_to_most_recent_without_override() {
        let sessions = vec![summary("A", 5), summary("B", 3)];
        let selector = SessionSelector::default();
        assert_eq!(selector.active(Some(&sessions)), Some("A"));
    }

    #[test]
    fn present_override_wins() {
        let sessions = vec![summary("A", 5), summary("B", 3)];
        let mut selector = SessionSelector::default();
        selector.set_manual("B");
        assert_eq!(selector.active(Some(&sessions)), Some("B"));
    }

    #[test]
    fn vanished_override_falls_back_to_most_recent() {
        let sessions = vec![summary("A", 5), summary("B", 3)];
        let mut selector = SessionSelector::default();
        selector.set_manual("Z");
        assert_eq!(selector.active(Some(&sessions)), Some("A"));
    }

    #[test]
    fn clear_drops_the_manual_pick() {
        let sessions = vec![summary("A", 5), summary("B", 3)];
        let mut selector = SessionSelector::default();
        selector.set_manual("B");
        selector.clear();
        assert_eq!(selector.active(Some(&sessions)), Some("A"));
        assert_eq!(selector.manual(), None);
    }
}
