use axum::http::StatusCode;
use thiserror::Error;

use crate::forensics::ForensicsError;

/// 一次分析请求可能的失败。每个变体都有稳定的错误码，前端按码分支。
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// 没有文件或文件为空
    #[error("no file uploaded")]
    NoFile,

    /// 扩展名不在白名单里，检测器不会被调用
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    /// 远程检测全部失败，且没有启用兜底
    #[error("{message}")]
    RemoteDetection { message: String, details: Vec<String> },

    /// 本地取证也无法解码图片。`remote` 保留之前远程检测的失败原因
    #[error("analysis failed: {source}")]
    Analysis {
        source: ForensicsError,
        remote: Vec<String>,
    },

    /// multipart 请求体无法解析
    #[error("malformed upload: {0}")]
    MalformedUpload(String),

    /// 上游注入的身份头格式不对
    #[error("malformed caller identity: {0}")]
    InvalidCaller(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalyzeError {
    pub fn code(&self) -> &'static str {
        match self {
            AnalyzeError::NoFile => "no_file",
            AnalyzeError::UnsupportedType(_) => "unsupported_type",
            AnalyzeError::RemoteDetection { .. } => "remote_detection_failed",
            AnalyzeError::Analysis { .. } => "analysis_failed",
            AnalyzeError::MalformedUpload(_) => "malformed_upload",
            AnalyzeError::InvalidCaller(_) => "invalid_caller",
            AnalyzeError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AnalyzeError::NoFile | AnalyzeError::InvalidCaller(_) | AnalyzeError::MalformedUpload(_) => {
                StatusCode::BAD_REQUEST
            }
            AnalyzeError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AnalyzeError::RemoteDetection { .. } | AnalyzeError::Analysis { .. } => StatusCode::BAD_GATEWAY,
            AnalyzeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Vec<String> {
        match self {
            AnalyzeError::RemoteDetection { details, .. } => details.clone(),
            AnalyzeError::Analysis { remote, .. } => remote.clone(),
            AnalyzeError::NoFile => vec!["No file uploaded".to_string()],
            _ => Vec::new(),
        }
    }
}

/// 启动配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {name}: expected {expected}")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}
