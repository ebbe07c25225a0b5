use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, services::ServeDir};
use uuid::Uuid;

use crate::config::AppCfg;
use crate::events::RunEvent;
use crate::export;
use crate::images::InlineImage;
use crate::orchestrator::{
    start_batch, BatchParams, BatchRequest, RunState, Session, StartError,
};
use crate::prompt::{AdFields, AspectRatio, Language, Template};
use crate::providers::{is_quota_message, AdCopyGenerator, AdCopySuggestion, AdImageGenerator, ProviderError};

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<AppCfg>,
    session: Arc<Mutex<Session>>,
    copy: Arc<dyn AdCopyGenerator>,
    images: Arc<dyn AdImageGenerator>,
    events_tx: broadcast::Sender<RunEvent>,
}

impl AppState {
    pub fn new(
        cfg: AppCfg,
        copy: Arc<dyn AdCopyGenerator>,
        images: Arc<dyn AdImageGenerator>,
    ) -> Self {
        let (events_tx, _rx) = broadcast::channel::<RunEvent>(256);
        Self {
            cfg: Arc::new(cfg),
            session: Arc::new(Mutex::new(Session::default())),
            copy,
            images,
            events_tx,
        }
    }
}

pub async fn serve(
    cfg: AppCfg,
    copy: Arc<dyn AdCopyGenerator>,
    images: Arc<dyn AdImageGenerator>,
) -> anyhow::Result<()> {
    let bind = cfg.server.bind.clone();
    let state = AppState::new(cfg, copy, images);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("adforge API listening on http://{bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let static_dir = state.cfg.server.static_dir.clone();
    let mut app = Router::new()
        .route("/api/ad-copy", post(ad_copy))
        .route("/api/generate", post(start_run))
        .route("/api/session", get(get_session))
        .route("/api/run/{id}/events", get(run_events))
        .route("/api/results/{id}/download", get(download_result))
        .route("/api/export", get(export_archive))
        .layer(CorsLayer::permissive())
        .with_state(state);
    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }
    app
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdCopyReq {
    description: String,
    language: Language,
}

async fn ad_copy(
    State(st): State<AppState>,
    Json(req): Json<AdCopyReq>,
) -> Result<Json<AdCopySuggestion>, ApiErr> {
    if req.description.trim().is_empty() {
        return Err(ApiErr::bad_request("description must not be empty"));
    }
    let suggestion = st
        .copy
        .suggest(&req.description, req.language)
        .await
        .map_err(ApiErr::from_provider)?;
    Ok(Json(suggestion))
}

fn default_template() -> Template {
    Template::Standard
}

fn default_batch_size() -> u32 {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReq {
    fields: AdFields,
    #[serde(default = "default_template")]
    template: Template,
    #[serde(default)]
    brand_color: String,
    #[serde(default)]
    watermark: bool,
    ratios: Vec<AspectRatio>,
    #[serde(default = "default_batch_size")]
    batch_size: u32,
    product: InlineImage,
    #[serde(default)]
    logo: Option<InlineImage>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRunResp {
    run_id: String,
    total_tasks: u64,
}

async fn start_run(
    State(st): State<AppState>,
    Json(req): Json<GenerateReq>,
) -> Result<Json<StartRunResp>, ApiErr> {
    let batch = BatchRequest {
        fields: req.fields,
        template: req.template,
        brand_color: req.brand_color,
        watermark: req.watermark,
        ratios: req.ratios,
        batch_size: req.batch_size,
        product: req.product,
        logo: req.logo,
    };
    let params = BatchParams {
        pacing: st.cfg.pacing(),
    };
    match start_batch(
        st.images.clone(),
        st.session.clone(),
        batch,
        params,
        Some(st.events_tx.clone()),
    ) {
        Ok(handle) => Ok(Json(StartRunResp {
            run_id: handle.run_id,
            total_tasks: handle.total,
        })),
        Err(StartError::Invalid(msg)) => Err(ApiErr::bad_request(msg)),
        Err(StartError::Busy) => Err(ApiErr::run_already_active()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResp {
    state: RunState,
    run_id: Option<String>,
    progress: ProgressResp,
    error: Option<String>,
    results: Vec<ResultResp>,
}

#[derive(Serialize)]
struct ProgressResp {
    dispatched: u64,
    total: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultResp {
    id: String,
    ratio: &'static str,
    data_url: String,
    filename: String,
}

async fn get_session(State(st): State<AppState>) -> Json<SessionResp> {
    let s = st.session.lock();
    Json(SessionResp {
        state: s.state,
        run_id: s.run_id.clone(),
        progress: ProgressResp {
            dispatched: s.progress.dispatched,
            total: s.progress.total,
        },
        error: s.error.clone(),
        results: s
            .results
            .iter()
            .map(|r| ResultResp {
                id: r.id.to_string(),
                ratio: r.ratio.as_str(),
                data_url: r.image.data_url(),
                filename: export::download_name(&s.brand_prefix, r.ratio, &r.id),
            })
            .collect(),
    })
}

async fn run_events(
    State(st): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = st.events_tx.subscribe();

    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| async move { msg.ok() })
        .filter(move |evt: &RunEvent| {
            let ok = evt.run_id() == run_id.as_str();
            futures_util::future::ready(ok)
        })
        .map(|evt| {
            let json = serde_json::to_string(&evt).unwrap_or_default();
            Ok(Event::default().event("message").data(json))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn download_result(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiErr> {
    let parsed = Uuid::parse_str(&id).map_err(|_| ApiErr::bad_request("invalid result id"))?;
    let (bytes, mime, filename) = {
        let s = st.session.lock();
        let result = s
            .results
            .iter()
            .find(|r| r.id == parsed)
            .ok_or_else(|| ApiErr::not_found("no such result"))?;
        (
            result.image.decode()?,
            result.image.mime_type.clone(),
            export::download_name(&s.brand_prefix, result.ratio, &result.id),
        )
    };

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_str(&mime)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            ),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))?,
            ),
        ],
        bytes,
    ))
}

async fn export_archive(State(st): State<AppState>) -> Result<impl IntoResponse, ApiErr> {
    let (bytes, name) = {
        let s = st.session.lock();
        if s.results.is_empty() {
            return Err(ApiErr::bad_request("no results to export"));
        }
        (
            export::build_archive(&s.brand_prefix, &s.results)?,
            export::archive_name(&s.brand_prefix),
        )
    };

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/zip"),
            ),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))?,
            ),
        ],
        bytes,
    ))
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    code: String,
    message: String,
    suggestion: Option<String>,
}

impl ApiErr {
    fn internal(e: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error".to_string(),
            message: format!("Internal error: {}", e),
            suggestion: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found".to_string(),
            message: message.into(),
            suggestion: None,
        }
    }

    fn run_already_active() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "run_already_active".to_string(),
            message: "A batch is already in progress".to_string(),
            suggestion: Some(
                "Wait for the current batch to finish; results stream in on the events endpoint."
                    .to_string(),
            ),
        }
    }

    fn from_provider(e: ProviderError) -> Self {
        let message = e.to_string();
        let suggestion = if is_quota_message(&message) {
            Some("Wait a minute before retrying, or reduce the batch size.".to_string())
        } else {
            None
        };
        let status = match e {
            ProviderError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            code: "generation_failed".to_string(),
            message,
            suggestion,
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiErr {
    fn from(e: E) -> Self {
        Self::internal(e.into())
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> axum::response::Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            code: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            suggestion: Option<String>,
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code,
                suggestion: self.suggestion,
            }),
        )
            .into_response()
    }
}
