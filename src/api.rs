use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::config::parse_bool;
use crate::error::AnalyzeError;
use crate::evidence::ResponseEnvelope;
use crate::pipeline::{Analyzer, Caller, Upload};

/// 上传大小上限
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// multipart 里承载图片的字段名
const FILE_FIELD: &str = "file";

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// Analyzer 内部自己管理共享资源 (缓存有锁，账本有锁)，这里只需要 Arc。
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
}

// ==========================================
// 2. 数据传输对象 (DTOs)
// ==========================================

#[derive(Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: &'static str,
    pub message: String,
    pub details: Vec<String>,
}

impl IntoResponse for AnalyzeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            ok: false,
            error: self.code(),
            message: self.to_string(),
            details: self.details(),
        };
        (self.status(), Json(body)).into_response()
    }
}

// ==========================================
// 3. 路由
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

// ==========================================
// 4. 处理函数 (Handlers)
// ==========================================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// 接口：分析一张图片
///
/// 请求体是 `multipart/form-data`，图片放在 `file` 字段里，文件名取自该字段。
/// 身份由上游认证层通过请求头注入：`x-user-id`、`x-charge-credit`。
async fn analyze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<ResponseEnvelope>, AnalyzeError> {
    let caller = caller_from_headers(&headers)?;
    let upload = read_upload(multipart).await?;
    info!(filename = %upload.filename, bytes = upload.bytes.len(), user = caller.user_id, "analyze request");

    let envelope = state.analyzer.analyze(upload, &caller).await?;
    Ok(Json(envelope))
}

/// 取第一个名为 `file` 的字段，其余字段忽略。没有该字段视为没上传文件。
async fn read_upload(mut multipart: Multipart) -> Result<Upload, AnalyzeError> {
    let malformed = |e: axum::extract::multipart::MultipartError| AnalyzeError::MalformedUpload(e.body_text());

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "ignoring multipart field");
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(malformed)?;
        return Ok(Upload {
            filename,
            bytes: bytes.to_vec(),
        });
    }
    Err(AnalyzeError::NoFile)
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, AnalyzeError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    let user_id = match header("x-user-id") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AnalyzeError::InvalidCaller(raw.to_string()))?,
        None => 0,
    };
    let charge = header("x-charge-credit").and_then(parse_bool).unwrap_or(true);

    Ok(Caller { user_id, charge })
}
