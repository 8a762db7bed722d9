//! HTTP API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use tsmerge_core::{
    EngineStats, FileId, ForceMergeReport, Level, MergeEngine, MergeError, PartitionId,
    PartitionLevels,
};

/// Application state
pub type AppState = Arc<MergeEngine>;

/// Create the API router
pub fn create_router(engine: Arc<MergeEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Flush pipeline hook
        .route("/files", post(register_file))

        // Administrative merge
        .route("/merge/:storage_group", post(force_merge))
        .route(
            "/storage-groups/:storage_group/partitions/:partition/levels",
            get(levels),
        )

        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFileRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RegisterFileResponse {
    pub file_id: FileId,
    pub storage_group: String,
    pub partition: PartitionId,
    pub level: Level,
    pub sequence: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(error: MergeError) -> ApiError {
    let status = match &error {
        MergeError::StorageGroupNotFound(_) | MergeError::FileNotFound(_) => StatusCode::NOT_FOUND,
        MergeError::Overlap(_) => StatusCode::CONFLICT,
        // Unreadable or missing files supplied by the caller
        MergeError::Io(_) => StatusCode::BAD_REQUEST,
        e if e.is_corruption() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: tsmerge_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn register_file(
    State(engine): State<AppState>,
    Json(req): Json<RegisterFileRequest>,
) -> Result<(StatusCode, Json<RegisterFileResponse>), ApiError> {
    let record = engine.register_file(&req.path).map_err(|e| {
        warn!("Rejected TsFile {:?}: {}", req.path, e);
        api_error(e)
    })?;
    let meta = record.meta();

    Ok((
        StatusCode::CREATED,
        Json(RegisterFileResponse {
            file_id: record.id(),
            storage_group: meta.storage_group.clone(),
            partition: meta.partition,
            level: meta.level,
            sequence: meta.sequence,
        }),
    ))
}

async fn force_merge(
    State(engine): State<AppState>,
    Path(storage_group): Path<String>,
) -> Result<Json<ForceMergeReport>, ApiError> {
    engine
        .force_merge(&storage_group)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn levels(
    State(engine): State<AppState>,
    Path((storage_group, partition)): Path<(String, PartitionId)>,
) -> Result<Json<PartitionLevels>, ApiError> {
    engine
        .levels(&storage_group, partition)
        .map(Json)
        .map_err(api_error)
}

async fn stats(State(engine): State<AppState>) -> Json<EngineStats> {
    Json(engine.stats())
}

async fn metrics(State(engine): State<AppState>) -> String {
    render_prometheus(&engine.stats())
}

fn render_prometheus(stats: &EngineStats) -> String {
    let m = &stats.metrics;
    let mut output = String::new();

    let counters = [
        ("tasks_started_total", "Merge tasks started", m.tasks_started),
        ("tasks_committed_total", "Merge tasks committed", m.tasks_committed),
        ("tasks_failed_total", "Merge tasks failed", m.tasks_failed),
        ("read_bytes_total", "Bytes read by merges", m.bytes_read),
        ("written_bytes_total", "Bytes written by merges", m.bytes_written),
        ("points_written_total", "Points written by merges", m.points_written),
        ("chunks_appended_total", "Chunks copied without decoding", m.chunks_appended),
        ("chunks_rewritten_total", "Chunks decoded and rewritten", m.chunks_rewritten),
        ("duration_ms_total", "Time spent in committed merges", m.total_merge_ms),
        (
            "selection_timeouts_total",
            "Selections cut short by their time budget",
            m.selection_timeouts,
        ),
        ("admission_delays_total", "Tasks delayed by the memory budget", m.admission_delays),
        (
            "read_throttled_ms_total",
            "Time merges waited on the read limiter",
            stats.read_throttled_ms,
        ),
        (
            "write_throttled_ms_total",
            "Time merges waited on the write limiter",
            stats.write_throttled_ms,
        ),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(output, "# HELP tsmerge_merge_{} {}", name, help);
        let _ = writeln!(output, "# TYPE tsmerge_merge_{} counter", name);
        let _ = writeln!(output, "tsmerge_merge_{} {}", name, value);
    }

    let gauges = [
        ("running_tasks", "Merge tasks admitted and not finished", stats.running_tasks as u64),
        ("reserved_memory_bytes", "Memory reserved by admitted tasks", stats.reserved_memory),
        ("live_files", "TsFiles tracked by the file set", stats.live_files as u64),
        ("pending_deletions", "Replaced files waiting for readers", stats.pending_deletions as u64),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(output, "# HELP tsmerge_{} {}", name, help);
        let _ = writeln!(output, "# TYPE tsmerge_{} gauge", name);
        let _ = writeln!(output, "tsmerge_{} {}", name, value);
    }

    output.push_str("# HELP tsmerge_level_files Files per level\n");
    output.push_str("# TYPE tsmerge_level_files gauge\n");
    for level in &stats.levels {
        let _ = writeln!(
            output,
            "tsmerge_level_files{{storage_group=\"{}\",partition=\"{}\",sequence=\"{}\",level=\"{}\"}} {}",
            level.storage_group, level.partition, level.sequence, level.level, level.file_count
        );
    }

    output
}
