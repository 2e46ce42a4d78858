use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;

use crate::{
    dlq::DlqFilter,
    error::ApiError,
    extractors::{ValidPath, ValidQuery},
    logger::LogQuery,
    state::AppState,
    types::{
        CircuitBreakerState, ClearDeadLettersRequest, ClearDeadLettersResponse, DeadLetterEntry,
        HealthLevel, HealthStatus, ListDeadLettersResponse, ListLogsResponse, ListRetriesResponse,
        LogLevel, ProcessingStats, ReplayResponse, RetryAllResponse, RetryRunStats,
    },
};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    level: Option<String>,
    operation: Option<String>,
    correlation_id: Option<String>,
    start_time: Option<i64>,
    end_time: Option<i64>,
}

pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.orchestrator.get_health_status().await;
    let status = match health.status {
        HealthLevel::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthLevel::Healthy | HealthLevel::Degraded => StatusCode::OK,
    };
    (status, Json(health))
}

pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<ProcessingStats>, ApiError> {
    let stats = state.orchestrator.get_processing_stats().await?;
    Ok(Json(stats))
}

pub async fn list_dead_letters_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<PageQuery>,
) -> Result<Json<ListDeadLettersResponse>, ApiError> {
    let limit = parse_limit(query.limit)?;
    let offset = parse_offset(query.offset)?;
    let entries = state
        .orchestrator
        .dlq()
        .get_dlq_entries(limit as usize, offset as usize)
        .await?;
    Ok(Json(ListDeadLettersResponse {
        entries,
        limit: limit as u32,
        offset: offset as u32,
    }))
}

pub async fn get_dead_letter_handler(
    State(state): State<AppState>,
    ValidPath(dlq_id): ValidPath<String>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    let dlq_id = parse_id("dlq_id", &dlq_id)?;
    state
        .orchestrator
        .dlq()
        .get_dlq_entry(&dlq_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("dead letter {dlq_id} not found")))
}

pub async fn replay_dead_letter_handler(
    State(state): State<AppState>,
    ValidPath(dlq_id): ValidPath<String>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let dlq_id = parse_id("dlq_id", &dlq_id)?;
    let replay = state
        .orchestrator
        .replay_failed_webhook(&dlq_id, state.processor.clone())
        .await?;
    Ok(Json(replay))
}

pub async fn clear_dead_letters_handler(
    State(state): State<AppState>,
    ValidQuery(req): ValidQuery<ClearDeadLettersRequest>,
) -> Result<Json<ClearDeadLettersResponse>, ApiError> {
    let filter = DlqFilter {
        event_type: non_empty("event_type", req.event_type)?,
        older_than: req.older_than,
    };
    let cleared = state.orchestrator.clear_dead_letter_queue(&filter).await?;
    Ok(Json(ClearDeadLettersResponse { cleared }))
}

pub async fn retry_all_handler(
    State(state): State<AppState>,
) -> Result<Json<RetryAllResponse>, ApiError> {
    let response = state
        .orchestrator
        .retry_all_failed_webhooks(state.processor.clone())
        .await?;
    Ok(Json(response))
}

pub async fn list_retries_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<PageQuery>,
) -> Result<Json<ListRetriesResponse>, ApiError> {
    let limit = parse_limit(query.limit)?;
    let entries = state
        .orchestrator
        .retries()
        .get_retry_entries(limit as usize)
        .await?;
    Ok(Json(ListRetriesResponse { entries }))
}

pub async fn process_retries_handler(
    State(state): State<AppState>,
) -> Result<Json<RetryRunStats>, ApiError> {
    let stats = state
        .orchestrator
        .process_pending_retries(state.processor.clone())
        .await?;
    Ok(Json(stats))
}

pub async fn list_logs_handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<LogsQuery>,
) -> Result<Json<ListLogsResponse>, ApiError> {
    let level = match query.level {
        Some(raw) => Some(
            LogLevel::parse(raw.trim())
                .ok_or_else(|| ApiError::validation("level is invalid"))?,
        ),
        None => None,
    };
    if let (Some(start), Some(end)) = (query.start_time, query.end_time)
        && start > end
    {
        return Err(ApiError::validation("start_time must not be after end_time"));
    }

    let log_query = LogQuery {
        correlation_id: non_empty("correlation_id", query.correlation_id)?,
        level,
        operation: non_empty("operation", query.operation)?,
        start_time: query.start_time,
        end_time: query.end_time,
        limit: parse_limit(query.limit)? as usize,
        offset: parse_offset(query.offset)? as usize,
    };

    let logs = state
        .orchestrator
        .logger()
        .query_logs(&log_query)
        .await
        .map_err(|err| ApiError::StoreUnavailable(err.to_string()))?;
    Ok(Json(ListLogsResponse { logs }))
}

pub async fn correlation_logs_handler(
    State(state): State<AppState>,
    ValidPath(correlation_id): ValidPath<String>,
) -> Result<Json<ListLogsResponse>, ApiError> {
    let correlation_id = parse_id("correlation_id", &correlation_id)?;
    let logs = state
        .orchestrator
        .logger()
        .get_logs_by_correlation_id(&correlation_id)
        .await
        .map_err(|err| ApiError::StoreUnavailable(err.to_string()))?;
    Ok(Json(ListLogsResponse { logs }))
}

pub async fn reset_circuit_handler(State(state): State<AppState>) -> Json<CircuitBreakerState> {
    let breaker = state.orchestrator.breaker();
    breaker.reset();
    Json(breaker.snapshot())
}

fn parse_limit(limit: Option<i64>) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(50);
    if !(1..=200).contains(&limit) {
        return Err(ApiError::validation("limit must be between 1 and 200"));
    }
    Ok(limit)
}

fn parse_offset(offset: Option<i64>) -> Result<i64, ApiError> {
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must not be negative"));
    }
    Ok(offset)
}

fn parse_id(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 255 {
        return Err(ApiError::validation(format!(
            "{field} must be between 1 and 255 characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn non_empty(field: &str, value: Option<String>) -> Result<Option<String>, ApiError> {
    match value {
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Err(ApiError::validation(format!("{field} must be non-empty")));
            }
            Ok(Some(trimmed.to_string()))
        }
        None => Ok(None),
    }
}
