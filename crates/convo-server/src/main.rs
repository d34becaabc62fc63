use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use clap::Parser;
use convo_core::{ErrorBody, MessagesResponse, SessionsResponse, Tenant};
use convo_storage::{ChatStore, ExportRow, TenantStores};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const AUTH_COOKIE: &str = "dashboard_auth";
const AUTH_COOKIE_VALUE: &str = "1";
const AUTH_COOKIE_MAX_AGE_HOURS: i64 = 8;
const EXPORT_HEADER: &str = "session_id,message_id,role,content,created_at";

#[derive(Parser, Debug)]
#[command(name = "convo-server")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    al_azhar_db: String,
    #[arg(long, default_value = "")]
    lestari_db: String,
    #[arg(long, default_value = "")]
    username: String,
    #[arg(long, default_value = "")]
    password: String,
}

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    al_azhar_db: Option<String>,
    lestari_db: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Clone)]
struct AppState {
    stores: Arc<Mutex<TenantStores>>,
    config: Arc<Config>,
    key: Key,
}

impl axum::extract::FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Key {
        state.key.clone()
    }
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    tenant: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    tenant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    tenant: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging();

    let stores = match open_stores(&config) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "store_open_error", error = %err);
            return;
        }
    };

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let state = AppState {
        stores: Arc::new(Mutex::new(stores)),
        config: Arc::new(config.clone()),
        key: resolve_cookie_key(),
    };

    let app = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:session_id/messages", get(list_messages))
        .route("/api/export", get(export_chats))
        .route("/api/login", post(login))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "server_error", error = %err);
            return;
        }
    };

    info!(event = "server_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "server_error", error = %err);
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(query): Query<SessionsQuery>,
) -> Response {
    if let Some(denied) = require_auth(&jar) {
        return denied;
    }
    let tenant = Tenant::from_param(query.tenant.as_deref());
    let limit = parse_limit(query.limit.as_deref());

    let stores = state.stores.lock().await;
    let result = stores
        .store(tenant)
        .and_then(|store| store.session_summaries(limit));
    match result {
        Ok(sessions) => Json(SessionsResponse { sessions }).into_response(),
        Err(err) => {
            error!(event = "sessions_query_error", tenant = %tenant, error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unable to fetch sessions.")
        }
    }
}

async fn list_messages(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    if let Some(denied) = require_auth(&jar) {
        return denied;
    }
    let tenant = Tenant::from_param(query.tenant.as_deref());
    if session_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Session id is required.");
    }

    let stores = state.stores.lock().await;
    let result = stores
        .store(tenant)
        .and_then(|store| store.messages_for_session(&session_id));
    match result {
        Ok(messages) => Json(MessagesResponse { messages }).into_response(),
        Err(err) => {
            error!(
                event = "messages_query_error",
                tenant = %tenant,
                session_id = %session_id,
                error = %err
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unable to fetch messages.")
        }
    }
}

async fn export_chats(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    Query(query): Query<ExportQuery>,
) -> Response {
    if let Some(denied) = require_auth(&jar) {
        return denied;
    }
    let tenant = Tenant::from_param(query.tenant.as_deref());
    let session_id = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let stores = state.stores.lock().await;
    let result = stores
        .store(tenant)
        .and_then(|store| store.export_rows(session_id));
    let rows = match result {
        Ok(rows) => rows,
        Err(err) => {
            error!(event = "export_query_error", tenant = %tenant, error = %err);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unable to export chats.");
        }
    };

    let csv = build_csv(&rows);
    let filename = export_filename(session_id);
    info!(
        event = "export_served",
        tenant = %tenant,
        rows = rows.len(),
        filename = %filename
    );

    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        csv,
    )
        .into_response()
}

async fn login(
    State(state): State<AppState>,
    jar: SignedCookieJar,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let (Some(expected_user), Some(expected_pass)) = (
        state.config.username.as_deref(),
        state.config.password.as_deref(),
    ) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Dashboard auth is not configured.",
        );
    };

    let Ok(Json(body)) = body else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid request body.");
    };

    if body.username != expected_user || body.password != expected_pass {
        warn!(event = "login_rejected", username = %body.username);
        return error_response(StatusCode::UNAUTHORIZED, "Invalid username or password.");
    }

    info!(event = "login_ok", username = %body.username);
    let cookie = Cookie::build((AUTH_COOKIE, AUTH_COOKIE_VALUE))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::hours(AUTH_COOKIE_MAX_AGE_HOURS))
        .build();
    (jar.add(cookie), Json(serde_json::json!({ "ok": true }))).into_response()
}

fn require_auth(jar: &SignedCookieJar) -> Option<Response> {
    let authorized = jar
        .get(AUTH_COOKIE)
        .map(|cookie| cookie.value() == AUTH_COOKIE_VALUE)
        .unwrap_or(false);
    if authorized {
        None
    } else {
        Some(error_response(
            StatusCode::UNAUTHORIZED,
            "Authentication required.",
        ))
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// A limit must parse as a positive number; anything else selects the
/// storage default.
fn parse_limit(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|value| *value > 0)
}

fn export_filename(session_id: Option<&str>) -> String {
    match session_id {
        Some(session_id) => format!("chat-{session_id}.csv"),
        None => "chats-all.csv".to_string(),
    }
}

/// Every field is quoted; embedded quotes are doubled and newlines collapse
/// to single spaces so one message stays one CSV record.
fn csv_cell(raw: &str) -> String {
    let flattened = raw.replace("\r\n", " ").replace('\n', " ");
    format!("\"{}\"", flattened.replace('"', "\"\""))
}

fn build_csv(rows: &[ExportRow]) -> String {
    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(EXPORT_HEADER.to_string());
    for row in rows {
        lines.push(
            [
                csv_cell(&row.session_id),
                csv_cell(&row.id.to_string()),
                csv_cell(row.role.as_str()),
                csv_cell(&row.content),
                csv_cell(&row.created_at.to_rfc3339()),
            ]
            .join(","),
        );
    }
    lines.join("\n")
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_value(&args.addr, "DASHBOARD_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string()),
        al_azhar_db: resolve_value(&args.al_azhar_db, "DATABASE_PATH"),
        lestari_db: resolve_value(&args.lestari_db, "LESTARI_DATABASE_PATH"),
        username: resolve_value(&args.username, "DASHBOARD_USERNAME"),
        password: resolve_value(&args.password, "DASHBOARD_PASSWORD"),
    }
}

fn resolve_value(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn open_stores(config: &Config) -> Result<TenantStores, convo_storage::StorageError> {
    if config.al_azhar_db.is_none() {
        warn!(event = "db_missing", tenant = "al-azhar");
    }
    if config.lestari_db.is_none() {
        warn!(event = "db_missing", tenant = "lestari");
    }
    let al_azhar = config
        .al_azhar_db
        .as_deref()
        .map(ChatStore::open)
        .transpose()?;
    let lestari = config
        .lestari_db
        .as_deref()
        .map(ChatStore::open)
        .transpose()?;
    TenantStores::new(al_azhar, lestari)
}

fn resolve_cookie_key() -> Key {
    match std::env::var("DASHBOARD_COOKIE_SECRET") {
        Ok(secret) if secret.trim().len() >= 32 => Key::derive_from(secret.as_bytes()),
        _ => {
            warn!(event = "cookie_key_generated");
            Key::generate()
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use convo_core::Role;

    fn row(session_id: &str, id: i64, role: Role, content: &str, secs: i64) -> ExportRow {
        ExportRow {
            id,
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn parse_limit_requires_positive_number() {
        assert_eq!(parse_limit(Some("25")), Some(25));
        assert_eq!(parse_limit(Some("0")), None);
        assert_eq!(parse_limit(Some("-5")), None);
        assert_eq!(parse_limit(Some("abc")), None);
        assert_eq!(parse_limit(None), None);
    }

    #[test]
    fn csv_cell_escapes_quotes_and_collapses_newlines() {
        assert_eq!(csv_cell("plain"), "\"plain\"");
        assert_eq!(csv_cell("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_cell("line one\nline two"), "\"line one line two\"");
        assert_eq!(csv_cell("a\r\nb"), "\"a b\"");
        assert_eq!(csv_cell(""), "\"\"");
    }

    #[test]
    fn export_header_is_exact() {
        let csv = build_csv(&[]);
        assert_eq!(csv, "session_id,message_id,role,content,created_at");
    }

    #[test]
    fn build_csv_renders_one_quoted_row_per_message() {
        let rows = vec![
            row("s-1", 1, Role::Human, "hello", 0),
            row("s-1", 2, Role::Ai, "a \"quoted\"\nreply", 5),
        ];
        let csv = build_csv(&rows);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], EXPORT_HEADER);
        assert!(lines[1].starts_with("\"s-1\",\"1\",\"human\""));
        assert!(lines[2].contains("\"a \"\"quoted\"\" reply\""));
    }

    #[test]
    fn export_filename_depends_on_scope() {
        assert_eq!(export_filename(None), "chats-all.csv");
        assert_eq!(export_filename(Some("abc")), "chat-abc.csv");
    }

    #[test]
    fn whole_tenant_export_matches_contract() {
        let store = ChatStore::open_in_memory().expect("open");
        store
            .insert_message(
                "s-1",
                Some("system"),
                "stored with a non-ai role",
                Utc.timestamp_opt(1_767_600_000, 0).unwrap(),
            )
            .expect("insert");
        let stores = TenantStores::new(None, Some(store)).expect("stores");

        let rows = stores
            .store(Tenant::Lestari)
            .unwrap()
            .export_rows(None)
            .expect("rows");
        let csv = build_csv(&rows);

        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "session_id,message_id,role,content,created_at"
        );
        let data = lines.next().unwrap();
        assert!(data.contains("\"human\""));
        assert_eq!(export_filename(None), "chats-all.csv");
    }
}
