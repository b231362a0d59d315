//! 编排器 (Orchestrator)
//!
//! 每个请求的状态机：
//!
//! ```text
//! Received -> CacheCheck -+-> Hit  -> Respond (credit_spent = false)
//!                         +-> Miss -> RemoteDetect -+-> Ok                  -> Finalize
//!                                                   +-> Err & fallback      -> LocalForensics -> Finalize
//!                                                   +-> Err & no fallback   -> ErrorRespond
//! Finalize = Shaper -> 取整 -> 计费 (一次) -> 写缓存 -> Respond
//! ```

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::billing::CreditLedger;
use crate::cache::{CachedVerdict, ResultCache};
use crate::config::PipelineSettings;
use crate::error::AnalyzeError;
use crate::evidence::{DetectionResult, ResponseEnvelope, Source, Usage};
use crate::hive::{HiveClient, RemoteFailure};
use crate::{fingerprint, forensics, preprocess, scoring};

/// 一次上传 (字节归请求独占，处理完即丢弃)
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// 上游认证层给出的调用方上下文
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: i64,
    /// 本次是否应该扣费
    pub charge: bool,
}

pub struct Analyzer {
    settings: PipelineSettings,
    hive: HiveClient,
    cache: Option<Arc<ResultCache>>,
    ledger: Arc<dyn CreditLedger>,
}

impl Analyzer {
    /// `cache` 为 None 或配置关闭缓存时，完全不读写缓存
    pub fn new(
        settings: PipelineSettings,
        hive: HiveClient,
        cache: Option<Arc<ResultCache>>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        let cache = cache.filter(|_| settings.cache_enabled);
        Self {
            settings,
            hive,
            cache,
            ledger,
        }
    }

    #[instrument(skip_all, fields(filename = %upload.filename, user = caller.user_id))]
    pub async fn analyze(&self, upload: Upload, caller: &Caller) -> Result<ResponseEnvelope, AnalyzeError> {
        // 1. 输入校验：任何检测器都还没启动
        if upload.bytes.is_empty() || upload.filename.trim().is_empty() {
            return Err(AnalyzeError::NoFile);
        }
        if !fingerprint::is_allowed_image(&upload.filename) {
            let ext = fingerprint::extension_of(&upload.filename).unwrap_or_default();
            return Err(AnalyzeError::UnsupportedType(ext));
        }

        let upload = Arc::new(upload);

        // 2. 缓存检查
        let hash = {
            let upload = Arc::clone(&upload);
            blocking(move || fingerprint::content_hash(&upload.bytes)).await?
        };
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&hash) {
                info!(hash = %hash, source = %hit.source, "cache hit");
                return Ok(envelope(hit, None));
            }
        }

        // 3. 远程检测，失败按策略兜底
        let result = match self.detect_remote(&upload).await? {
            Ok(result) => result,
            Err(failure) if self.settings.fallback_enabled => {
                warn!(message = %failure.message, "remote detection failed, falling back to forensics");
                self.detect_local(&upload, failure).await?
            }
            Err(failure) => {
                return Err(AnalyzeError::RemoteDetection {
                    message: failure.message,
                    details: failure.details,
                })
            }
        };

        // 4. Finalize
        let verdict = self.finalize(result);
        let usage = self.spend_credit(caller, verdict.source);

        let verdict = match &self.cache {
            Some(cache) => {
                let cache = Arc::clone(cache);
                let key = hash.clone();
                blocking(move || cache.insert_if_absent(&key, verdict)).await?
            }
            None => verdict,
        };

        info!(hash = %hash, source = %verdict.source, credit_spent = usage.credit_spent, "analysis complete");
        Ok(envelope(verdict, Some(usage)))
    }

    /// 外层 Err 只代表内部任务失败；内层 Result 才是远程检测本身的结果
    async fn detect_remote(
        &self,
        upload: &Arc<Upload>,
    ) -> Result<Result<DetectionResult, RemoteFailure>, AnalyzeError> {
        let (max_edge, tta) = (self.settings.max_edge, self.settings.tta);
        let batch = {
            let upload = Arc::clone(upload);
            blocking(move || preprocess::prepare_variants(&upload.bytes, max_edge, tta)).await?
        };
        Ok(self.hive.detect(&batch).await)
    }

    /// 本地取证。远程失败的诊断信息保留在 details 末尾，方便排查；
    /// 取证自己也失败时，这些信息随错误一起返回。
    async fn detect_local(
        &self,
        upload: &Arc<Upload>,
        failure: RemoteFailure,
    ) -> Result<DetectionResult, AnalyzeError> {
        let remote = remote_reasons(failure);
        let upload = Arc::clone(upload);
        match blocking(move || forensics::analyze(&upload.bytes, &upload.filename)).await? {
            Ok(mut result) => {
                result.details.extend(remote);
                Ok(result)
            }
            Err(source) => {
                warn!(error = %source, "forensics fallback failed");
                Err(AnalyzeError::Analysis { source, remote })
            }
        }
    }

    /// 整形 -> 取整 -> 缓存条目
    fn finalize(&self, result: DetectionResult) -> CachedVerdict {
        let (real, fake) = scoring::shape(result.real, result.fake, &self.settings.shaping);
        let (real, fake) = scoring::round_output(real, fake, self.settings.integer_output);
        CachedVerdict {
            real,
            fake,
            message: result.message,
            details: result.details,
            source: result.source,
            cached_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 扣费失败只影响 usage，分数照常返回
    fn spend_credit(&self, caller: &Caller, source: Source) -> Usage {
        if !caller.charge {
            return Usage {
                source,
                credit_spent: false,
                credits_left: None,
            };
        }

        match self
            .ledger
            .spend_one(caller.user_id, &format!("analyze:{}", source))
        {
            Ok(left) => Usage {
                source,
                credit_spent: true,
                credits_left: left,
            },
            Err(e) => {
                warn!(user = caller.user_id, error = %e, "credit spend failed");
                Usage {
                    source,
                    credit_spent: false,
                    credits_left: None,
                }
            }
        }
    }
}

fn remote_reasons(failure: RemoteFailure) -> Vec<String> {
    std::iter::once(failure.message)
        .chain(failure.details)
        .map(|reason| format!("remote detection unavailable: {}", reason))
        .collect()
}

/// 缓存命中时 usage 为 None：标记为未扣费
fn envelope(verdict: CachedVerdict, usage: Option<Usage>) -> ResponseEnvelope {
    let usage = usage.unwrap_or(Usage {
        source: verdict.source,
        credit_spent: false,
        credits_left: None,
    });
    ResponseEnvelope {
        ok: true,
        real: verdict.real,
        fake: verdict.fake,
        message: verdict.message,
        details: verdict.details,
        source: verdict.source,
        usage,
    }
}

/// CPU 密集型操作放到 blocking 线程池
async fn blocking<T, F>(f: F) -> Result<T, AnalyzeError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AnalyzeError::Internal(format!("task join error: {}", e)))
}
