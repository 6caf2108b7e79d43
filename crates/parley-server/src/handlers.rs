//! HTTP handlers for the Parley server.
//!
//! These are thin wrappers around [`MessageBuffer`]: posting a message and
//! long-polling for updates. A long-poll handler holds a [`parley_core::Waiter`]
//! across its await; when the client disconnects, axum drops the handler
//! future and the waiter cancels itself.

use crate::config::Config;
use crate::metrics;
use crate::session::{self, CurrentUser, SessionKey};
use anyhow::Result;
use axum::{
    extract::{Form, FromRef, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use parley_core::{escape_html, HtmlRenderer, Message, MessageBuffer, MessageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message buffer.
    pub buffer: MessageBuffer,
    /// Server configuration.
    pub config: Config,
    /// Renderer for new messages.
    pub renderer: HtmlRenderer,
    /// Key for signing session cookies.
    pub session: SessionKey,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured cookie secret is unusable.
    pub fn new(config: Config) -> Result<Self> {
        let session = match config.session.cookie_secret.as_deref() {
            Some(secret) => SessionKey::from_secret(secret.as_bytes())?,
            None => {
                warn!("No session cookie_secret configured; sessions end when the server restarts");
                SessionKey::generate()?
            }
        };
        Ok(Self {
            buffer: MessageBuffer::with_config(config.buffer_config()),
            config,
            renderer: HtmlRenderer,
            session,
        })
    }
}

impl FromRef<Arc<AppState>> for SessionKey {
    fn from_ref(state: &Arc<AppState>) -> Self {
        state.session.clone()
    }
}

/// Form body for `POST /login`.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    name: String,
}

/// Form body for `POST /message/new`.
#[derive(Debug, Deserialize)]
pub struct NewMessageForm {
    message: String,
    #[serde(default)]
    next: Option<String>,
}

/// Form body for `POST /message/updates`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdatesForm {
    #[serde(default)]
    cursor: Option<String>,
}

/// Response body for `POST /message/updates`.
#[derive(Debug, Serialize)]
struct UpdatesResponse<'a> {
    messages: Vec<&'a Message>,
}

/// Build the application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_form_handler).post(login_handler))
        .route("/logout", get(logout_handler))
        .route("/message/new", post(message_new_handler))
        .route("/message/updates", post(message_updates_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(addr).await?;
    info!("Parley server listening on http://{}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Only allow same-site relative redirects.
fn safe_redirect_target(next: &str) -> Option<&str> {
    let offsite = next.starts_with("//") || next.starts_with("/\\");
    (next.starts_with('/') && !offsite).then_some(next)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Chat page listing the cached messages.
async fn index_handler(
    State(state): State<Arc<AppState>>,
    user: Option<CurrentUser>,
) -> Response {
    let Some(CurrentUser(name)) = user else {
        return Redirect::to("/login").into_response();
    };

    let messages: String = state
        .buffer
        .messages()
        .iter()
        .map(|m| m.rendered.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Parley</title></head>
<body>
<div id="nav"><b>{name}</b> - <a href="/logout">Sign out</a></div>
<div id="inbox">
{messages}
</div>
<form action="/message/new" method="post" id="messageform">
<input type="text" name="message" id="message" style="width:500px">
<input type="hidden" name="next" value="/">
<input type="submit" value="Post">
</form>
</body>
</html>"#,
        name = escape_html(&name),
    ))
    .into_response()
}

/// Sign-in form.
async fn login_form_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Parley</title></head>
<body>
<form action="/login" method="post">
Name: <input type="text" name="name">
<input type="submit" value="Sign in">
</form>
</body>
</html>"#,
    )
}

/// Sign in by setting the session cookie.
async fn login_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let name = form.name.trim();
    if let Err(reason) = session::validate_name(name) {
        metrics::record_error("login");
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    debug!(user = %name, "Signed in");
    (
        [(header::SET_COOKIE, session::login_cookie(&state.session, name))],
        Redirect::to("/"),
    )
        .into_response()
}

/// Sign out by clearing the session cookie.
async fn logout_handler() -> Response {
    (
        [(header::SET_COOKIE, session::logout_cookie())],
        Redirect::to("/"),
    )
        .into_response()
}

/// Post a new message to the buffer.
async fn message_new_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(author): CurrentUser,
    Form(form): Form<NewMessageForm>,
) -> Response {
    let body = form.message.trim();
    if body.is_empty() {
        metrics::record_error("validation");
        return error_response(StatusCode::BAD_REQUEST, "Message cannot be empty");
    }
    if body.len() > state.config.limits.max_message_length {
        metrics::record_error("validation");
        return error_response(StatusCode::BAD_REQUEST, "Message too long");
    }

    let message = Message::new(author, body, &state.renderer);
    let response = match form.next.as_deref().and_then(safe_redirect_target) {
        Some(next) => Redirect::to(next).into_response(),
        None => Json(&message).into_response(),
    };

    // A single message is never an empty batch, so posting cannot fail.
    let id = message.id;
    let posted = state.buffer.post([message]);
    debug_assert!(posted.is_ok(), "posting one message returned {posted:?}");
    if let Ok(waiters) = posted {
        debug!(message = %id, waiters, "Posted message");
        metrics::record_posted(1);
        metrics::set_buffer_stats(&state.buffer.stats());
    }
    response
}

/// Long-poll for messages after the given cursor.
async fn message_updates_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Form(form): Form<UpdatesForm>,
) -> Response {
    // A cursor that does not parse cannot name a cached message; treat it
    // like any other unknown cursor.
    let cursor: Option<MessageId> = form
        .cursor
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .and_then(|c| c.parse().ok());

    let waiter = state.buffer.wait(cursor.as_ref());
    // Dropped with the handler future if the client goes away mid-wait.
    let poll = metrics::PollMetricsGuard::new(&state.buffer, waiter.id());

    let result = match state.config.longpoll.timeout() {
        Some(timeout) => match tokio::time::timeout(timeout, waiter).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Long-poll timed out");
                poll.finish(Some("timeout"));
                return Json(UpdatesResponse { messages: vec![] }).into_response();
            }
        },
        None => waiter.await,
    };
    poll.finish(None);

    // Only this handler holds the waiter, so it resolves with a batch.
    let batch = result.unwrap_or_else(|_| Arc::from(Vec::new()));
    let messages = batch.iter().map(|m| &**m).collect();
    Json(UpdatesResponse { messages }).into_response()
}
