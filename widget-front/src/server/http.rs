//! HTTP server implementation for the live widget coordinator.
//!
//! JSON endpoints for session, widget and lock operations, plus an SSE
//! stream of collaboration events per session.

use crate::config::ServerConfig;
use crate::error::FrontError;
use app::app::coordinator::SessionCoordinator;
use app::app::session::SessionRegistry;
use axum::extract::{FromRequest, Path, Query, Request, State};
use axum::http::{header, Method};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::stream::StreamExt;
use livecell_base::protocol::{
    BatchUpdateRequest, BatchUpdateResponse, ConstraintsResponse, ExecuteCellRequest,
    ExecutionOutput, HistoryEntry, LockRequest, LockResponse, RegisterWidgetRequest, SessionInfo,
    StartSessionRequest, UpdateOutcome, UpdateValueRequest,
};
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetRecord};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Application state for axum handlers.
#[derive(Debug)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub config: ServerConfig,
}

impl AppState {
    fn session(&self, session_id: &SessionId) -> Result<Arc<SessionCoordinator>, AppError> {
        Ok(self.sessions.get(session_id)?)
    }

    /// Run one coordinator call under the request deadline.
    async fn deadline<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.config.request_timeout(), fut).await {
            Ok(res) => Ok(res?),
            Err(_) => {
                tracing::warn!(timeout_sec = self.config.timeout_sec, "coordinator call timed out");
                Err(AppError(FrontError::Timeout {
                    timeout_sec: self.config.timeout_sec,
                }))
            }
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/", get(index_handler))
        .nest("/api", Router::new().route("/health", get(health_handler)))
        .route("/live/sessions", post(start_session_handler))
        .route(
            "/live/sessions/{session_id}",
            axum::routing::delete(end_session_handler),
        )
        .route("/live/sessions/{session_id}/state", get(session_state_handler))
        .route(
            "/live/sessions/{session_id}/cells/{cell_id}/execute",
            post(execute_cell_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets",
            get(list_widgets_handler).post(register_widget_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets/{widget_id}",
            get(widget_state_handler).delete(unregister_widget_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets/{widget_id}/value",
            put(update_value_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets/{widget_id}/constraints",
            get(constraints_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets/{widget_id}/history",
            get(history_handler),
        )
        .route(
            "/live/sessions/{session_id}/widgets/{widget_id}/lock",
            post(lock_handler).delete(unlock_handler),
        )
        .route("/live/sessions/{session_id}/batch", post(batch_handler))
        .route("/live/sessions/{session_id}/events", get(events_handler))
        .layer(cors)
        .with_state(state)
}

/// Boot the widget front on `config.bind_addr`. Without `shutdown_signal`
/// the server stops on ctrl-c.
pub async fn boot_widget_server(
    sessions: Arc<SessionRegistry>,
    config: ServerConfig,
    shutdown_signal: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("widget front started on {}", config.bind_addr);

    let shutdown_future: Pin<Box<dyn Future<Output = ()> + Send>> = match shutdown_signal {
        Some(signal) => signal,
        None => {
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("shutting down widget front...");
                        let _ = tx.send(());
                    }
                    Err(e) => tracing::error!("failed to listen for ctrl_c: {:?}", e),
                }
            });
            Box::pin(async move {
                rx.await.ok();
            })
        }
    };
    serve(listener, sessions, config, shutdown_future).await
}

/// Serve on an already bound listener. On shutdown every live session is
/// ended first, which closes the open event streams.
pub async fn serve(
    listener: TcpListener,
    sessions: Arc<SessionRegistry>,
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(Arc::new(AppState {
        sessions: sessions.clone(),
        config,
    }));
    let shutdown = async move {
        shutdown.await;
        for info in sessions.list() {
            if let Err(e) = sessions.end_session(&info.session_id).await {
                tracing::warn!(session_id = %info.session_id, "failed to end session: {:?}", e);
            }
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("widget front stopped");
    Ok(())
}

/// JSON body whose decode failures answer with the regular error body.
struct JsonBody<T>(T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(AppError(FrontError::InvalidInput(rejection.body_text()))),
        }
    }
}

async fn index_handler() -> &'static str {
    "livecell widget front"
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": livecell_base::APP_FRONT_NAME
    }))
}

/// POST /live/sessions
async fn start_session_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(req): JsonBody<StartSessionRequest>,
) -> Result<Json<SessionInfo>, AppError> {
    let session = state
        .deadline(state.sessions.start_session(req.session_id))
        .await?;
    Ok(Json(session.info()))
}

/// DELETE /live/sessions/{session_id}
async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state
        .deadline(state.sessions.end_session(&session_id))
        .await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn session_state_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(state.deadline(session.engine_state()).await?))
}

async fn execute_cell_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, cell_id)): Path<(SessionId, String)>,
    JsonBody(req): JsonBody<ExecuteCellRequest>,
) -> Result<Json<ExecutionOutput>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(
        state
            .deadline(session.execute_cell(&cell_id, &req.code))
            .await?,
    ))
}

async fn list_widgets_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Vec<WidgetRecord>>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(session.get_all().await))
}

async fn register_widget_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    JsonBody(req): JsonBody<RegisterWidgetRequest>,
) -> Result<Json<WidgetRecord>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(state.deadline(session.register_widget(req)).await?))
}

async fn widget_state_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
) -> Result<Json<WidgetRecord>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(state.deadline(session.get_state(&widget_id)).await?))
}

async fn unregister_widget_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.session(&session_id)?;
    let removed = state.deadline(session.unregister(&widget_id)).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

/// PUT /live/sessions/{session_id}/widgets/{widget_id}/value
async fn update_value_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
    JsonBody(req): JsonBody<UpdateValueRequest>,
) -> Result<Json<UpdateOutcome>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(
        state
            .deadline(session.update_value(&widget_id, req))
            .await?,
    ))
}

async fn constraints_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
) -> Result<Json<ConstraintsResponse>, AppError> {
    let session = state.session(&session_id)?;
    let constraints = state
        .deadline(session.get_constraints(&widget_id))
        .await?;
    Ok(Json(ConstraintsResponse {
        widget_id,
        constraints,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    since: Option<u64>,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let session = state.session(&session_id)?;
    Ok(Json(
        state
            .deadline(session.history(&widget_id, query.since))
            .await?,
    ))
}

async fn lock_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
    JsonBody(req): JsonBody<LockRequest>,
) -> Result<Json<LockResponse>, AppError> {
    let session = state.session(&session_id)?;
    let acquired = session.request_lock(&widget_id, &req.holder_id)?;
    let lock = state.deadline(session.get_state(&widget_id)).await?.lock;
    Ok(Json(LockResponse {
        widget_id,
        acquired,
        lock,
    }))
}

async fn unlock_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, widget_id)): Path<(SessionId, WidgetId)>,
    JsonBody(req): JsonBody<LockRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.session(&session_id)?;
    let released = session.release_lock(&widget_id, &req.holder_id)?;
    Ok(Json(serde_json::json!({ "released": released })))
}

/// POST /live/sessions/{session_id}/batch
async fn batch_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    JsonBody(req): JsonBody<BatchUpdateRequest>,
) -> Result<Json<BatchUpdateResponse>, AppError> {
    let session = state.session(&session_id)?;
    let resp = state
        .deadline(async { Ok(session.batch_update(req.updates, req.holder_id).await) })
        .await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "clientId")]
    client_id: Option<ClientId>,
}

/// GET /live/sessions/{session_id}/events - collaboration events as SSE.
///
/// Best effort: a lagging subscriber skips what it missed. The stream ends
/// with the session.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.session(&session_id)?;
    tracing::debug!(session_id = %session_id, client_id = ?query.client_id, "event stream opened");
    let sse_stream = session
        .subscribe(query.client_id)
        .into_stream()
        .map(|event| {
            let data = match serde_json::to_string(&event) {
                Ok(serialized) => serialized,
                Err(e) => {
                    tracing::warn!(error = ?e, "failed to serialize event for SSE");
                    "{}".to_string()
                }
            };
            Ok::<_, Infallible>(Event::default().event(event.event_name()).data(data))
        });

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response.headers_mut().insert(
        header::HeaderName::from_static("x-accel-buffering"),
        header::HeaderValue::from_static("no"),
    );
    Ok(response)
}

/// Application error type for axum handlers.
#[derive(Debug)]
struct AppError(FrontError);

impl From<FrontError> for AppError {
    fn from(err: FrontError) -> Self {
        AppError(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError(FrontError::Coordinator(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        if kind.is_user_resolvable() {
            tracing::debug!(code = %kind, "request rejected: {}", self.0);
        } else {
            tracing::warn!(code = %kind, "request failed: {:?}", self.0);
        }
        let body = serde_json::json!({
            "error": {
                "code": kind.as_str(),
                "message": self.0.to_string()
            }
        });
        (self.0.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use livecell_base::error::LiveError;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn app() -> Router {
        let module = app::module::test::new_for_test();
        router(Arc::new(AppState {
            sessions: module.sessions.clone(),
            config: ServerConfig::default(),
        }))
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_app_error_response() {
        let err = AppError::from(anyhow::Error::from(LiveError::NotFound("s".to_string())));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let resp = app()
            .oneshot(HttpRequest::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let resp = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/live/sessions/nope/widgets")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_register_and_update_snaps_value() {
        let app = app();
        let resp = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/live/sessions",
                serde_json::json!({ "sessionId": "s1" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/live/sessions/s1/widgets",
                serde_json::json!({
                    "widgetId": "w1",
                    "widgetType": "slider",
                    "value": { "kind": "number", "value": 0.0 },
                    "properties": { "min": 0.0, "max": 10.0, "step": 2.0 }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                "/live/sessions/s1/widgets/w1/value",
                serde_json::json!({ "value": { "kind": "number", "value": 7.0 } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["value"]["value"], 6.0);
        assert_eq!(outcome["version"], 1);

        let resp = app
            .oneshot(json_request(
                Method::PUT,
                "/live/sessions/s1/widgets/w1/value",
                serde_json::json!({ "value": { "kind": "text", "value": "high" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_parameter() {
        let resp = app()
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/live/sessions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "INVALID_PARAMETER");
    }
}
