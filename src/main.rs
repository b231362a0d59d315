use std::sync::Arc;

use realcheck_core::{
    api,
    billing::MemoryLedger,
    cache::ResultCache,
    config::Config,
    hive::HiveClient,
    pipeline::Analyzer,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ----------------------------------------------------------------
    // 0. 加载配置
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        host = %config.host,
        port = config.port,
        models = ?config.hive.models,
        tta = config.pipeline.tta,
        fallback = config.pipeline.fallback_enabled,
        cache = config.pipeline.cache_enabled,
        shaping = config.pipeline.shaping.enabled,
        "⚙️  配置加载完成"
    );
    if config.hive.api_key.is_none() {
        warn!("HIVE_API_KEY 未设置：远程检测将直接失败，只能依赖本地取证兜底");
    }

    // ----------------------------------------------------------------
    // 1. 组装流水线
    // ----------------------------------------------------------------
    let cache = config
        .pipeline
        .cache_enabled
        .then(|| Arc::new(ResultCache::load(&config.cache_path)));
    let ledger = Arc::new(MemoryLedger::new(config.free_credits));
    let hive = HiveClient::new(&config.hive)?;

    let analyzer = Analyzer::new(config.pipeline.clone(), hive, cache, ledger);
    let shared_state = Arc::new(api::AppState {
        analyzer: Arc::new(analyzer),
    });

    // ----------------------------------------------------------------
    // 2. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("🚀 API 服务已运行在: http://{}", addr);
    info!("   - GET  /health  : 健康检查");
    info!("   - POST /analyze (multipart, 字段 file) : 上传图片进行真伪打分");

    axum::serve(listener, app).await?;

    Ok(())
}
