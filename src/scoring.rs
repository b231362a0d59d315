//! 分数处理：归一化 (Normalizer)、整形 (Shaper)、输出取整。
//!
//! 这里全部是纯函数，没有共享状态，任何 worker 线程都可以直接调用。

use serde::{Deserialize, Serialize};

use crate::evidence::ScoreValue;

/// 远程模型对某个变体给出的一条 (标签, 置信度)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    #[serde(rename = "class", default)]
    pub label: String,
    #[serde(default)]
    pub score: f64,
}

impl ClassScore {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

const REAL_ALIASES: &[&str] = &["real", "non_fake", "authentic", "genuine"];
const FAKE_ALIASES: &[&str] = &["fake", "ai", "ai_generated", "synthetic", "deepfake"];

/// 锐化后伪造概率的硬夹紧区间
pub const SHAPED_FLOOR: f64 = 0.02;
pub const SHAPED_CEIL: f64 = 0.98;

// ==========================================
// 1. 归一化 (Normalizer)
// ==========================================

/// 把任意一组 (标签, 置信度) 压成一对合法的 (real, fake)，和恒为 100。
///
/// - 置信度 > 1.0 视为已经是百分比，先除以 100
/// - 只有一个桶有值：另一个取补数
/// - 两个桶都没有：显式中性 (50, 50)，不是错误
/// - 最后按和重新缩放到 100；和为 0 时退回 (50, 50)
pub fn normalize_classes(classes: &[ClassScore]) -> (f64, f64) {
    let mut real: Option<f64> = None;
    let mut fake: Option<f64> = None;

    for item in classes {
        let label = item.label.trim().to_lowercase();
        let mut score = if item.score.is_finite() { item.score } else { 0.0 };
        if score > 1.0 {
            score /= 100.0;
        }

        if REAL_ALIASES.contains(&label.as_str()) {
            real = Some(score * 100.0);
        } else if FAKE_ALIASES.contains(&label.as_str()) {
            fake = Some(score * 100.0);
        }
    }

    let (real, fake) = match (real, fake) {
        (Some(r), Some(f)) => (r, f),
        (Some(r), None) => (r, clamp_pct(100.0 - r)),
        (None, Some(f)) => (clamp_pct(100.0 - f), f),
        (None, None) => (50.0, 50.0),
    };

    let real = clamp_pct(real);
    let fake = clamp_pct(fake);

    let total = real + fake;
    if total <= 0.0 {
        return (50.0, 50.0);
    }
    (real * 100.0 / total, fake * 100.0 / total)
}

/// TTA 聚合：对每个变体的 (real, fake) 取算术平均。空输入返回中性值。
pub fn average_pairs(pairs: &[(f64, f64)]) -> (f64, f64) {
    if pairs.is_empty() {
        return (50.0, 50.0);
    }
    let n = pairs.len() as f64;
    let (sum_real, sum_fake) = pairs
        .iter()
        .fold((0.0, 0.0), |(ar, af), (r, f)| (ar + r, af + f));
    (sum_real / n, sum_fake / n)
}

fn clamp_pct(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

// ==========================================
// 2. 整形 (Shaper)
// ==========================================

/// 分数整形开关 + 指数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shaping {
    pub enabled: bool,
    /// γ > 1 向 0/1 两极化
    pub gamma: f64,
}

impl Default for Shaping {
    fn default() -> Self {
        Self {
            enabled: false,
            gamma: 2.5,
        }
    }
}

/// 单调锐化。关闭时原样返回。
///
/// $$ s = \frac{p_f^\gamma}{p_f^\gamma + (1-p_f)^\gamma} $$
/// 然后把 s 夹到 [0.02, 0.98]，再换回 0..100 的一对分数。
pub fn shape(real: f64, fake: f64, shaping: &Shaping) -> (f64, f64) {
    if !shaping.enabled {
        return (real, fake);
    }

    let p_fake = (fake / 100.0).clamp(0.0, 1.0);
    let p_real = 1.0 - p_fake;

    let pf_g = p_fake.powf(shaping.gamma);
    let pr_g = p_real.powf(shaping.gamma);
    let denom = if pf_g + pr_g > 0.0 { pf_g + pr_g } else { 1.0 };
    let p_fake_s = (pf_g / denom).clamp(SHAPED_FLOOR, SHAPED_CEIL);

    let fake_s = p_fake_s * 100.0;
    (100.0 - fake_s, fake_s)
}

// ==========================================
// 3. 输出取整
// ==========================================

/// 按配置把 (real, fake) 变成最终输出值。
///
/// 整数模式下各自四舍五入，和不为 100 的残差加到当前较大的一方 (平局归 real)。
/// 小数模式下 real 取两位小数，fake 取 100 - real 的两位小数。
pub fn round_output(real: f64, fake: f64, integer: bool) -> (ScoreValue, ScoreValue) {
    if integer {
        let mut real_out = real.round() as i64;
        let mut fake_out = fake.round() as i64;
        let diff = 100 - (real_out + fake_out);
        if diff != 0 {
            if real_out >= fake_out {
                real_out += diff;
            } else {
                fake_out += diff;
            }
        }
        (ScoreValue::Int(real_out), ScoreValue::Int(fake_out))
    } else {
        let real_out = round2(real);
        let fake_out = round2(100.0 - real_out);
        (ScoreValue::Float(real_out), ScoreValue::Float(fake_out))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
