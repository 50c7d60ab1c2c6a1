//! HTTP gateway: the REST half of the task API.

use axum::extract::{Path, Query, State};
use axum::middleware::map_response;
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use loom_core::domain::{Task, TaskId, TaskSpec, TaskState, TaskView};
use loom_core::observability::TaskCounts;
use loom_core::ports::ListQuery;
use loom_core::{LoomError, TaskService};

#[derive(Clone)]
struct HttpState {
    service: TaskService,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<TaskId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub task_counts: TaskCounts,
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    state: Option<String>,
    name_prefix: Option<String>,
    page_size: Option<usize>,
    page_token: Option<String>,
    view: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ViewParams {
    view: Option<String>,
}

/// Failures mapped to HTTP statuses with a `{"error": ...}` body.
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Loom(LoomError),
}

impl From<LoomError> for ApiError {
    fn from(err: LoomError) -> Self {
        ApiError::Loom(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Loom(err) => {
                let status = match &err {
                    LoomError::NotFound(_) => StatusCode::NOT_FOUND,
                    LoomError::Validation(_) | LoomError::UnsupportedStorage { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(service: TaskService, disable_http_cache: bool) -> Router {
    let router = Router::new()
        .route("/v1/tasks", post(create_task).get(list_tasks))
        // `POST /v1/tasks/{id}:cancel` arrives as one segment.
        .route("/v1/tasks/:id", get(get_task).post(task_action))
        .route("/v1/service-info", get(service_info))
        .with_state(HttpState { service });
    let router = if disable_http_cache {
        router.layer(map_response(no_store))
    } else {
        router
    };
    router.layer(TraceLayer::new_for_http())
}

/// Marks every response, error bodies included, as uncacheable.
async fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn parse_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|err: loom_core::domain::ParseIdError| ApiError::BadRequest(err.to_string()))
}

fn parse_view(raw: Option<&str>) -> Result<TaskView, ApiError> {
    raw.map(str::parse::<TaskView>)
        .transpose()
        .map(Option::unwrap_or_default)
        .map_err(ApiError::BadRequest)
}

async fn create_task(
    State(state): State<HttpState>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let id = state.service.create_task(spec).await?;
    Ok(Json(CreateTaskResponse { id }))
}

async fn list_tasks(
    State(state): State<HttpState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let query = ListQuery {
        state: params
            .state
            .as_deref()
            .map(str::parse::<TaskState>)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        name_prefix: params.name_prefix,
        page_size: params.page_size,
        page_token: params.page_token.as_deref().map(parse_id).transpose()?,
        view: parse_view(params.view.as_deref())?,
    };
    let page = state.service.list_tasks(&query).await?;
    Ok(Json(ListTasksResponse {
        tasks: page.tasks,
        next_page_token: page.next_page_token,
    }))
}

async fn get_task(
    State(state): State<HttpState>,
    Path(raw): Path<String>,
    Query(params): Query<ViewParams>,
) -> Result<Json<Task>, ApiError> {
    let id = parse_id(&raw)?;
    let view = parse_view(params.view.as_deref())?;
    let task = state.service.get_task(id, view).await?;
    Ok(Json(task))
}

async fn task_action(
    State(state): State<HttpState>,
    Path(raw): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some((raw_id, action)) = raw.rsplit_once(':') else {
        return Err(ApiError::NotFound(format!("no action in {raw:?}")));
    };
    match action {
        "cancel" => {
            let id = parse_id(raw_id)?;
            state.service.cancel_task(id).await?;
            Ok(Json(serde_json::json!({})))
        }
        other => Err(ApiError::NotFound(format!("unknown task action {other:?}"))),
    }
}

async fn service_info(State(state): State<HttpState>) -> Result<Json<ServiceInfo>, ApiError> {
    let task_counts = state.service.counts().await?;
    Ok(Json(ServiceInfo {
        name: "loom".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        task_counts,
    }))
}
