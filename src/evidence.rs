use serde::{Deserialize, Serialize}; // 序列化库：结构体 <-> JSON (响应体 & 缓存文件)
use std::fmt;

// ==========================================
// 1. 检测来源 (Source)
// ==========================================
// 哪条检测路径产出了这个分数。
// 序列化为小写字符串 "hive" / "forensics"，前端和缓存文件里都是这个形态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// 远程多模型检测 (Hive task/sync)
    Hive,
    /// 本地启发式取证 (ELA / EXIF / 锐度 / 高频 / pHash)
    Forensics,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Hive => "hive",
            Source::Forensics => "forensics",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 2. 检测结果 (DetectionResult)
// ==========================================
// 两条检测路径的统一产出。
// 不变量：real + fake == 100 (浮点误差内)。失败不放在这里，而是走 Result 的 Err 分支。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// 真实概率，0..=100
    pub real: f64,
    /// 伪造 (AI 生成) 概率，0..=100
    pub fake: f64,
    /// 给人看的一句话结论
    pub message: String,
    /// 诊断明细，按产生顺序
    pub details: Vec<String>,
    pub source: Source,
}

// ==========================================
// 3. 输出数值 (ScoreValue)
// ==========================================
// 配置决定输出整数还是两位小数。
// untagged：JSON 里直接是 87 或 87.25，不带类型标签。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Int(i64),
    Float(f64),
}

// ==========================================
// 4. 响应信封 (ResponseEnvelope)
// ==========================================

/// 计费信息。`credit_spent` 是计费协作方的事实，这里只负责搬运。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub source: Source,
    pub credit_spent: bool,
    /// 扣费后的剩余额度；缓存命中、免扣费或扣费失败时为 null
    pub credits_left: Option<i64>,
}

/// 最终返回给 HTTP 层的对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub real: ScoreValue,
    pub fake: ScoreValue,
    pub message: String,
    pub details: Vec<String>,
    pub source: Source,
    pub usage: Usage,
}
