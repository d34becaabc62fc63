//! Typed request/response functions against the dashboard API. Transport
//! failures and non-success responses collapse into one error type; retries
//! are the caller's policy (the next poll tick or a manual refresh).

use convo_core::{ChatMessage, MessagesResponse, SessionSummary, SessionsResponse, Tenant};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Remote(String),
    #[error("Session id is required.")]
    MissingSessionId,
    #[error("{0}")]
    Export(String),
    #[error("Invalid username or password.")]
    Unauthorized,
}

pub struct Gateway {
    http: reqwest::Client,
    base_url: Url,
}

impl Gateway {
    pub fn new(base_url: Url) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|err| GatewayError::Remote(err.to_string()))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path)
            .map_err(|err| GatewayError::Remote(err.to_string()))
    }

    /// Obtains the session cookie; the cookie store carries it on every
    /// subsequent call.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), GatewayError> {
        let url = self.endpoint("api/login")?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|err| GatewayError::Remote(err.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(GatewayError::Remote(error_message(response).await));
        }
        Ok(())
    }

    /// Session list for one tenant, already sorted most-recent-first by the
    /// server.
    pub async fn fetch_sessions(&self, tenant: Tenant) -> Result<Vec<SessionSummary>, GatewayError> {
        let mut url = self.endpoint("api/sessions")?;
        url.query_pairs_mut().append_pair("tenant", tenant.as_str());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::Remote(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Remote(error_message(response).await));
        }
        let payload: SessionsResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Remote(err.to_string()))?;
        Ok(payload.sessions)
    }

    /// Full thread for one session, ascending by creation time. A blank id
    /// is rejected before any request goes out.
    pub async fn fetch_messages(
        &self,
        session_id: &str,
        tenant: Tenant,
    ) -> Result<Vec<ChatMessage>, GatewayError> {
        if session_id.trim().is_empty() {
            return Err(GatewayError::MissingSessionId);
        }
        let mut url = self.endpoint(&format!("api/sessions/{session_id}/messages"))?;
        url.query_pairs_mut().append_pair("tenant", tenant.as_str());

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::Remote(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Remote(error_message(response).await));
        }
        let payload: MessagesResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Remote(err.to_string()))?;
        Ok(payload.messages)
    }

    /// CSV export, one session or the whole tenant. Failures never touch
    /// cached state; the caller surfaces them as a blocking alert.
    pub async fn export_csv(
        &self,
        tenant: Tenant,
        session_id: Option<&str>,
    ) -> Result<(String, Vec<u8>), GatewayError> {
        let mut url = self.endpoint("api/export")?;
        url.query_pairs_mut().append_pair("tenant", tenant.as_str());
        if let Some(session_id) = session_id {
            url.query_pairs_mut().append_pair("session_id", session_id);
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::Export(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::Export(error_message(response).await));
        }

        let filename = match session_id {
            Some(session_id) => format!("chat-{session_id}.csv"),
            None => "chats-all.csv".to_string(),
        };
        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::Export(err.to_string()))?;
        Ok((filename, bytes.to_vec()))
    }
}

/// Best error message available: the JSON body's `error` field, else the
/// raw body text, else a generic fallback.
async fn error_message(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    extract_error_message(&body)
}

fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
            if !message.is_empty() {
                return message.to_string();
            }
        }
    }
    if !body.trim().is_empty() {
        return body.trim().to_string();
    }
    "Unexpected API error.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_json_error_field() {
        assert_eq!(
            extract_error_message("{\"error\":\"Unable to fetch sessions.\"}"),
            "Unable to fetch sessions."
        );
    }

    #[test]
    fn error_message_falls_back_to_raw_body_then_generic() {
        assert_eq!(extract_error_message("gateway timeout"), "gateway timeout");
        assert_eq!(extract_error_message("  "), "Unexpected API error.");
        // JSON without an error field falls through to the raw body.
        assert_eq!(extract_error_message("{\"ok\":false}"), "{\"ok\":false}");
    }

    #[tokio::test]
    async fn blank_session_id_fails_before_any_request() {
        let gateway = Gateway::new(Url::parse("http://127.0.0.1:9/").unwrap()).unwrap();
        let result = gateway.fetch_messages("   ", Tenant::AlAzhar).await;
        assert!(matches!(result, Err(GatewayError::MissingSessionId)));
    }
}
