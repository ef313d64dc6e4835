//! Axum + Askama admin surface: settings form and a manual "pull now" action.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use calpull_sync::{RunMode, SettingsError, SyncPipeline};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "calpull-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SettingsQuery {
    saved: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct SettingsForm {
    feed_url: String,
    timezone: String,
}

#[derive(Template)]
#[template(path = "settings.html")]
struct SettingsTemplate {
    feed_url: String,
    timezone: String,
    schedule: String,
    saved: bool,
}

#[derive(Template)]
#[template(path = "pull_events.html")]
struct PullEventsTemplate {
    lines: Vec<String>,
    summary: String,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    heading: String,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(settings_page_handler))
        .route("/settings", post(save_settings_handler))
        .route("/pull-events", post(pull_events_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("CALPULL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn settings_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SettingsQuery>,
) -> Response {
    match state.pipeline.settings().load().await {
        Ok(settings) => render_html(SettingsTemplate {
            feed_url: settings.feed_url,
            timezone: settings.timezone,
            schedule: settings.schedule,
            saved: query.saved.is_some(),
        }),
        Err(err) => error_page(StatusCode::INTERNAL_SERVER_ERROR, "Settings unavailable", err.to_string()),
    }
}

async fn save_settings_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SettingsForm>,
) -> Response {
    let store = state.pipeline.settings();
    let mut settings = match store.load().await {
        Ok(settings) => settings,
        Err(err) => {
            return error_page(StatusCode::INTERNAL_SERVER_ERROR, "Settings unavailable", err.to_string())
        }
    };
    settings.feed_url = form.feed_url.trim().to_string();
    settings.timezone = form.timezone.trim().to_string();

    match store.save(&settings).await {
        Ok(()) => Redirect::to("/?saved=1").into_response(),
        Err(err @ SettingsError::InvalidTimezone(_)) => {
            error_page(StatusCode::BAD_REQUEST, "Invalid settings", err.to_string())
        }
        Err(err) => error_page(StatusCode::INTERNAL_SERVER_ERROR, "Settings not saved", err.to_string()),
    }
}

/// Runs the pipeline interactively; the response body is the confirmation output.
async fn pull_events_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once(RunMode::Interactive).await {
        Ok(summary) => render_html(PullEventsTemplate {
            summary: summary.summary_line(),
            lines: summary.confirmations,
        }),
        Err(err) => {
            warn!("manual pull failed: {err:#}");
            error_page(StatusCode::BAD_GATEWAY, "Pull failed", format!("{err:#}"))
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn error_page(status: StatusCode, heading: &str, message: String) -> Response {
    let tpl = ErrorTemplate {
        heading: heading.to_string(),
        message,
    };
    match tpl.render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
