use crate::hub::{self, LiveHub};
use crate::render::{render_events_page, render_issues_page};
use axum::{
    extract::{FromRef, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use farmwatch_core::{ForumMessage, IssueStatus, OpsEvent, WorkItem};
use farmwatch_store::{
    EventQuery, IssueCounts, IssueFilter, Store, StoreError, TopicSummary, DEFAULT_EVENT_LIMIT,
    DEFAULT_MESSAGE_LIMIT, DEFAULT_TOPIC_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

const DASHBOARD_HTML: &str = include_str!("assets/dashboard.html");

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub hub: Arc<LiveHub>,
    pub root_label: String,
}

impl FromRef<AppState> for Arc<LiveHub> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.hub)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/healthz", get(|| async { "ok" }))
        .route("/api/summary", get(summary))
        .route("/api/issues", get(list_issues))
        .route("/api/issues/:id", get(get_issue))
        .route("/api/issues/:id/children", get(issue_children))
        .route("/api/forum/topics", get(forum_topics))
        .route("/api/forum/messages", get(forum_messages))
        .route("/api/events", get(list_events))
        .route("/issues", get(issues_page))
        .route("/events", get(events_page))
        .route("/ws", get(hub::ws_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Store(StoreError),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Store(err) => {
                error!(event = "store_error", error = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Internal(message) => {
                error!(event = "internal_error", error = %message);
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Runs a store call on the blocking pool.
async fn with_store<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || call(&store))
        .await
        .map_err(|err| ApiError::Internal(format!("store task failed: {err}")))?
        .map_err(ApiError::from)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|raw| !raw.trim().is_empty())
}

fn parse_limit(raw: Option<&str>, default: usize) -> Result<usize, ApiError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| ApiError::BadRequest(format!("invalid limit: {value:?}"))),
    }
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

#[derive(Debug, Serialize)]
pub struct Summary {
    pub root: String,
    pub issues: IssueCounts,
    pub topics: usize,
    pub events: usize,
    pub clients: usize,
    pub generated_at_ms: i64,
}

pub async fn summary(State(state): State<AppState>) -> Result<Json<Summary>, ApiError> {
    let (issues, topics, events) = with_store(&state, |store| {
        let issues = store.issue_counts()?;
        let topics = store.list_topics(None, usize::MAX)?.len();
        let events = store.event_count()?;
        Ok((issues, topics, events))
    })
    .await?;
    Ok(Json(Summary {
        root: state.root_label.clone(),
        issues,
        topics,
        events,
        clients: state.hub.client_count().await,
        generated_at_ms: Utc::now().timestamp_millis(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueParams {
    pub status: Option<String>,
    pub tag: Option<String>,
    pub root: Option<String>,
}

impl IssueParams {
    fn into_filter(self) -> IssueFilter {
        IssueFilter {
            status: non_empty(self.status).map(IssueStatus::from),
            tag: non_empty(self.tag),
            root: non_empty(self.root),
        }
    }
}

pub async fn list_issues(
    State(state): State<AppState>,
    Query(params): Query<IssueParams>,
) -> Result<Json<Vec<WorkItem>>, ApiError> {
    let filter = params.into_filter();
    let items = with_store(&state, move |store| store.list_issues_filtered(&filter)).await?;
    Ok(Json(items))
}

pub async fn get_issue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkItem>, ApiError> {
    let lookup = id.clone();
    match with_store(&state, move |store| store.get_issue(&lookup)).await? {
        Some(item) => Ok(Json(item)),
        None => Err(ApiError::NotFound(format!("unknown issue: {id}"))),
    }
}

pub async fn issue_children(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<WorkItem>>, ApiError> {
    let items = with_store(&state, move |store| store.children(&id)).await?;
    Ok(Json(items))
}

#[derive(Debug, Default, Deserialize)]
pub struct TopicParams {
    pub prefix: Option<String>,
    pub limit: Option<String>,
}

pub async fn forum_topics(
    State(state): State<AppState>,
    Query(params): Query<TopicParams>,
) -> Result<Json<Vec<TopicSummary>>, ApiError> {
    let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOPIC_LIMIT)?;
    let prefix = non_empty(params.prefix);
    let topics = with_store(&state, move |store| store.list_topics(prefix.as_deref(), limit)).await?;
    Ok(Json(topics))
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageParams {
    pub topic: Option<String>,
    pub limit: Option<String>,
}

pub async fn forum_messages(
    State(state): State<AppState>,
    Query(params): Query<MessageParams>,
) -> Result<Json<Vec<ForumMessage>>, ApiError> {
    let Some(topic) = non_empty(params.topic) else {
        return Err(ApiError::BadRequest("missing topic".to_string()));
    };
    let limit = parse_limit(params.limit.as_deref(), DEFAULT_MESSAGE_LIMIT)?;
    let messages = with_store(&state, move |store| store.list_messages(&topic, limit)).await?;
    Ok(Json(messages))
}

#[derive(Debug, Default, Deserialize)]
pub struct EventParams {
    pub issue_id: Option<String>,
    pub run_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub limit: Option<String>,
}

impl EventParams {
    fn into_query(self) -> Result<EventQuery, ApiError> {
        Ok(EventQuery {
            limit: parse_limit(self.limit.as_deref(), DEFAULT_EVENT_LIMIT)?,
            issue_id: non_empty(self.issue_id),
            run_id: non_empty(self.run_id),
            event_type: non_empty(self.event_type),
        })
    }
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<Json<Vec<OpsEvent>>, ApiError> {
    let query = params.into_query()?;
    let events = with_store(&state, move |store| store.query_events(&query)).await?;
    Ok(Json(events))
}

pub async fn issues_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let items = with_store(&state, |store| store.list_issues()).await?;
    Ok(Html(render_issues_page(&state.root_label, &items)))
}

pub async fn events_page(
    State(state): State<AppState>,
    Query(params): Query<EventParams>,
) -> Result<Html<String>, ApiError> {
    let query = params.into_query()?;
    let lookup = query.clone();
    let events = with_store(&state, move |store| store.query_events(&lookup)).await?;
    Ok(Html(render_events_page(&state.root_label, &query, &events)))
}
