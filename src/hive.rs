//! 远程检测客户端 (Hive `task/sync`)
//!
//! 按配置顺序逐个尝试模型，第一个能解析出分数的模型胜出，剩下的不再调用。
//! 每个模型最多重试一次，而且只针对 "Invalid Auth Token" 的 403 (换 Bearer 头再试)。

use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HiveSettings;
use crate::evidence::{DetectionResult, Source};
use crate::preprocess::VariantBatch;
use crate::scoring::{self, ClassScore};

pub const MSG_AUTHENTIC: &str = "likely authentic";
pub const MSG_AI: &str = "likely AI-generated";
pub const MSG_ALL_FAILED: &str = "remote detection failed (all models)";
pub const MSG_NO_CREDENTIAL: &str = "remote credential missing";

const INVALID_TOKEN_MARKER: &str = "Invalid Auth Token";
const ERROR_BODY_LIMIT: usize = 200;

/// 远程路径失败：一句话 + 按模型顺序收集的错误串
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    pub message: String,
    pub details: Vec<String>,
}

// ==========================================
// 请求 / 响应结构 (DTOs)
// ==========================================

#[derive(Debug, Serialize)]
struct TaskRequest<'a> {
    model: &'a str,
    input: Vec<TaskInput<'a>>,
}

#[derive(Debug, Serialize)]
struct TaskInput<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    status: Vec<TaskStatus>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    #[serde(default)]
    response: Option<TaskOutput>,
}

#[derive(Debug, Deserialize)]
struct TaskOutput {
    #[serde(default)]
    output: Vec<VariantOutput>,
}

#[derive(Debug, Deserialize)]
struct VariantOutput {
    #[serde(default)]
    classes: Vec<ClassScore>,
}

/// 授权头的两种写法
#[derive(Debug, Clone, Copy)]
enum AuthScheme {
    Token,
    Bearer,
}

impl AuthScheme {
    fn header_value(&self, key: &str) -> String {
        match self {
            AuthScheme::Token => format!("Token {}", key),
            AuthScheme::Bearer => format!("Bearer {}", key),
        }
    }
}

pub struct HiveClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    models: Vec<String>,
}

impl HiveClient {
    /// 构建客户端。超时挂在 reqwest Client 上，对每次调用生效。
    pub fn new(settings: &HiveSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
            models: settings.models.clone(),
        })
    }

    /// 依次尝试每个模型，第一个成功解析的结果直接返回
    pub async fn detect(&self, batch: &VariantBatch) -> Result<DetectionResult, RemoteFailure> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(RemoteFailure {
                message: MSG_NO_CREDENTIAL.to_string(),
                details: vec![
                    "Set HIVE_API_KEY in the environment".to_string(),
                    "Alternatively: REALCHECK_HIVE_API_KEY".to_string(),
                ],
            });
        };

        let mut errors = Vec::new();
        for model in &self.models {
            match self.query_model(model, key, batch, &mut errors).await {
                Some(result) => {
                    info!(model = %model, real = result.real, fake = result.fake, "remote detection succeeded");
                    return Ok(result);
                }
                None => debug!(model = %model, "model failed, trying next"),
            }
        }

        warn!(errors = ?errors, "all remote models failed");
        Err(RemoteFailure {
            message: MSG_ALL_FAILED.to_string(),
            details: errors,
        })
    }

    /// 单个模型的一次完整尝试。失败时把原因追加进 `errors` 并返回 None。
    async fn query_model(
        &self,
        model: &str,
        key: &str,
        batch: &VariantBatch,
        errors: &mut Vec<String>,
    ) -> Option<DetectionResult> {
        let payload = TaskRequest {
            model,
            input: batch
                .variants
                .iter()
                .map(|image| TaskInput { image })
                .collect(),
        };

        let response = match self.post(&payload, key, AuthScheme::Token).await {
            Ok(r) => r,
            Err(e) => {
                errors.push(format!("{}: {}", model, e));
                return None;
            }
        };

        let response = if response.status().is_success() {
            response
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            errors.push(format!("{}: {} {}", model, status.as_u16(), truncate(&body, ERROR_BODY_LIMIT)));

            if status != StatusCode::FORBIDDEN || !body.contains(INVALID_TOKEN_MARKER) {
                return None;
            }

            // 403 + Invalid Auth Token：换 Bearer 写法重试一次
            match self.post(&payload, key, AuthScheme::Bearer).await {
                Err(e) => {
                    errors.push(format!("{} retry: {}", model, e));
                    return None;
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    errors.push(format!("{} retry: {} {}", model, status, truncate(&body, ERROR_BODY_LIMIT)));
                    return None;
                }
                Ok(r) => r,
            }
        };

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                errors.push(format!("{}: {}", model, e));
                return None;
            }
        };
        let parsed: TaskResponse = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(_) => {
                errors.push(format!("{}: invalid JSON", model));
                return None;
            }
        };

        match aggregate(model, parsed, batch) {
            Ok(result) => Some(result),
            Err(reason) => {
                errors.push(format!("{}: parse error: {}", model, reason));
                None
            }
        }
    }

    async fn post(
        &self,
        payload: &TaskRequest<'_>,
        key: &str,
        scheme: AuthScheme,
    ) -> Result<Response, reqwest::Error> {
        self.client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, scheme.header_value(key))
            .json(payload)
            .send()
            .await
    }
}

/// 每个变体单独归一化，再对模型内所有变体取平均
fn aggregate(
    model: &str,
    parsed: TaskResponse,
    batch: &VariantBatch,
) -> Result<DetectionResult, &'static str> {
    let first = parsed.status.into_iter().next().ok_or("status missing")?;
    let outputs = first.response.map(|r| r.output).unwrap_or_default();
    if outputs.is_empty() {
        return Err("output missing");
    }

    let pairs: Vec<(f64, f64)> = outputs
        .iter()
        .map(|o| scoring::normalize_classes(&o.classes))
        .collect();
    let (real, fake) = scoring::average_pairs(&pairs);

    let raw = outputs
        .iter()
        .map(|o| {
            let classes = o
                .classes
                .iter()
                .map(|c| format!("{}={:.4}", c.label, c.score))
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{}]", classes)
        })
        .collect::<Vec<_>>()
        .join(" ");

    let message = if real > fake { MSG_AUTHENTIC } else { MSG_AI };
    Ok(DetectionResult {
        real,
        fake,
        message: message.to_string(),
        details: vec![
            format!("Hive model: {}", model),
            format!("Preprocessing: {}", batch.description),
            format!("TTA: {} variants (avg)", outputs.len()),
            format!("Raw: {}", raw),
        ],
        source: Source::Hive,
    })
}

/// 按字符截断，避免切在 UTF-8 中间
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
