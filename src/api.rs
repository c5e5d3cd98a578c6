use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    analytics::{self, DateFilter},
    app_state::{AppState, Status},
    models::{AnalyticsSummary, ConversationRecord},
};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn detail(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": message.into() })))
}

// --- Payloads ---

#[derive(Debug, Default, Deserialize)]
pub struct SummaryQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/analytics/summary", get(summary_handler))
        .route("/api/status", get(status_handler))
        .with_state(app_state)
}

// --- Handlers ---

#[axum::debug_handler]
async fn summary_handler(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<AnalyticsSummary>, ApiError> {
    let filter = parse_filter(&query)?;
    let records = load_records(&state).await?;
    let total = records.len();

    match analytics::build_summary(records, &filter) {
        Ok(summary) => {
            info!(
                "Resumen servido: {} de {} conversaciones (filtro {:?})",
                summary.summary.total_conversations, total, filter
            );
            Ok(Json(summary))
        }
        Err(reason) => {
            warn!("Sin datos para el resumen: {}", reason.detail());
            Err(detail(StatusCode::NOT_FOUND, reason.detail()))
        }
    }
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Result<Json<Status>, ApiError> {
    let records = load_records(&state).await?;
    Ok(Json(Status {
        status: "ok",
        conversations: records.len(),
        conversations_dir: state.conversations_dir.display().to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    }))
}

// --- Utilidades ---

async fn load_records(state: &AppState) -> Result<Vec<ConversationRecord>, ApiError> {
    let dir = state.conversations_dir.clone();
    if !dir.is_dir() {
        warn!("El directorio de conversaciones {} no existe", dir.display());
        return Ok(Vec::new());
    }
    tokio::task::spawn_blocking(move || analytics::load_conversations(&dir))
        .await
        .map_err(|e| {
            error!("La carga de conversaciones terminó de forma inesperada: {e}");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load conversations")
        })?
        .map_err(|e| {
            error!("Error cargando conversaciones: {e:#}");
            detail(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to load conversations: {e}"))
        })
}

fn parse_date(field: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d").map(Some).map_err(|_| {
            detail(
                StatusCode::BAD_REQUEST,
                format!("Invalid {field} '{value}', expected YYYY-MM-DD"),
            )
        }),
    }
}

fn parse_filter(query: &SummaryQuery) -> Result<DateFilter, ApiError> {
    let filter = DateFilter {
        start: parse_date("start_date", query.start_date.as_deref())?,
        end: parse_date("end_date", query.end_date.as_deref())?,
    };
    if let (Some(start), Some(end)) = (filter.start, filter.end) {
        if start > end {
            return Err(detail(
                StatusCode::BAD_REQUEST,
                "start_date must be on or before end_date",
            ));
        }
    }
    Ok(filter)
}
