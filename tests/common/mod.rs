//! 集成测试共用的夹具：本地 Hive 模拟服务、样例图片、流水线组装。

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use serde_json::{json, Value};

use realcheck_core::billing::{CreditLedger, MemoryLedger};
use realcheck_core::cache::ResultCache;
use realcheck_core::config::{HiveSettings, PipelineSettings};
use realcheck_core::hive::HiveClient;
use realcheck_core::pipeline::Analyzer;
use realcheck_core::preprocess::encode_jpeg;

/// 模拟服务对一次调用的回复
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
    pub delay: Option<Duration>,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_status(StatusCode::OK, body)
    }

    pub fn with_status(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// 记录下来的一次调用
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub model: String,
    pub authorization: String,
    pub inputs: usize,
}

type Responder = dyn Fn(&str, &str) -> Reply + Send + Sync;

#[derive(Clone)]
struct MockState {
    calls: Arc<Mutex<Vec<Call>>>,
    responder: Arc<Responder>,
}

pub struct MockHive {
    pub endpoint: String,
    pub calls: Arc<Mutex<Vec<Call>>>,
}

impl MockHive {
    /// `responder(model, authorization)` 决定每次调用的回复
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&str, &str) -> Reply + Send + Sync + 'static,
    {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            calls: Arc::clone(&calls),
            responder: Arc::new(responder),
        };
        let app = Router::new()
            .route("/api/v2/task/sync", post(handle))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{}/api/v2/task/sync", addr),
            calls,
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn settings(&self, key: Option<&str>, models: &[&str]) -> HiveSettings {
        HiveSettings {
            api_key: key.map(String::from),
            models: models.iter().map(|m| m.to_string()).collect(),
            endpoint: self.endpoint.clone(),
            timeout: Duration::from_secs(5),
        }
    }
}

async fn handle(State(state): State<MockState>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, String) {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let inputs = body["input"].as_array().map(|a| a.len()).unwrap_or(0);

    state.calls.lock().push(Call {
        model: model.clone(),
        authorization: authorization.clone(),
        inputs,
    });

    let reply = (state.responder)(&model, &authorization);
    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }
    (reply.status, reply.body)
}

/// Hive 风格的成功响应：每个元素是一个变体的 ai_generated 置信度
pub fn hive_body(fake_scores: &[f64]) -> String {
    let output: Vec<Value> = fake_scores
        .iter()
        .map(|&f| {
            json!({
                "classes": [
                    { "class": "ai_generated", "score": f },
                    { "class": "not_ai_generated", "score": 1.0 - f }
                ]
            })
        })
        .collect();
    json!({ "status": [ { "response": { "output": output } } ] }).to_string()
}

/// 纯色 JPEG (没有任何元数据)
pub fn uniform_jpeg(w: u32, h: u32) -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(w, h, Rgb([90, 140, 200])), 95).unwrap()
}

/// 带渐变纹理的 JPEG
pub fn gradient_jpeg(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8]));
    encode_jpeg(&img, 92).unwrap()
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        tta: 3,
        max_edge: 1024,
        fallback_enabled: true,
        cache_enabled: true,
        ..PipelineSettings::default()
    }
}

/// 不指向任何真实服务的远程配置 (没有凭据，不会发请求)
pub fn offline_hive() -> HiveClient {
    HiveClient::new(&HiveSettings::default()).unwrap()
}

pub fn analyzer(
    settings: PipelineSettings,
    hive: HiveClient,
    cache: Option<Arc<ResultCache>>,
    ledger: Arc<MemoryLedger>,
) -> Analyzer {
    let ledger: Arc<dyn CreditLedger> = ledger;
    Analyzer::new(settings, hive, cache, ledger)
}
