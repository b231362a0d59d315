use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::scoring::Shaping;

pub const DEFAULT_HIVE_ENDPOINT: &str = "https://api.thehive.ai/api/v2/task/sync";
/// 模型优先级：先通用 AI 图像检测，再 synthetic，最后 deepfake
pub const DEFAULT_HIVE_MODELS: &[&str] = &[
    "ai-generated-image-detection",
    "synthetic-image-detection",
    "deepfake-detection",
];

/// 远程检测器配置
#[derive(Debug, Clone)]
pub struct HiveSettings {
    pub api_key: Option<String>,
    pub models: Vec<String>,
    pub endpoint: String,
    /// 单次远程调用超时
    pub timeout: Duration,
}

impl Default for HiveSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            models: DEFAULT_HIVE_MODELS.iter().map(|m| m.to_string()).collect(),
            endpoint: DEFAULT_HIVE_ENDPOINT.to_string(),
            timeout: Duration::from_secs(45),
        }
    }
}

/// 打分流水线配置
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// TTA 变体数，1..=5
    pub tta: u8,
    /// 预处理后的最大边长 (px)
    pub max_edge: u32,
    /// 远程失败时是否走本地取证
    pub fallback_enabled: bool,
    pub cache_enabled: bool,
    pub shaping: Shaping,
    /// true 输出整数百分比，false 输出两位小数
    pub integer_output: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tta: 3,
            max_edge: 1024,
            fallback_enabled: false,
            cache_enabled: true,
            shaping: Shaping::default(),
            integer_output: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cache_path: PathBuf,
    /// 内存账本给每个新用户的免费额度
    pub free_credits: i64,
    pub hive: HiveSettings,
    pub pipeline: PipelineSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            cache_path: PathBuf::from("temp_upload/results_cache.json"),
            free_credits: 100,
            hive: HiveSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Config {
    /// 环境变量覆盖默认值。数值/布尔解析失败直接报错，启动阶段就暴露问题。
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let api_key = string_var("HIVE_API_KEY").or_else(|| string_var("REALCHECK_HIVE_API_KEY"));

        let models = match string_var("HIVE_MODELS") {
            Some(raw) => parse_models(&raw),
            None => d.hive.models,
        };

        let tta: u8 = parse_var("REALCHECK_TTA", d.pipeline.tta)?;
        let gamma: f64 = parse_var("REALCHECK_SHAPING_GAMMA", d.pipeline.shaping.gamma)?;
        if !(gamma.is_finite() && gamma > 0.0) {
            return Err(ConfigError::InvalidValue {
                name: "REALCHECK_SHAPING_GAMMA",
                value: gamma.to_string(),
                expected: "a positive number",
            });
        }

        Ok(Self {
            host: string_var("HOST").unwrap_or(d.host),
            port: parse_var("PORT", d.port)?,
            cache_path: string_var("REALCHECK_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.cache_path),
            free_credits: parse_var("REALCHECK_FREE_CREDITS", d.free_credits)?,
            hive: HiveSettings {
                api_key,
                models,
                endpoint: string_var("HIVE_ENDPOINT").unwrap_or(d.hive.endpoint),
                timeout: Duration::from_secs(parse_var("HIVE_TIMEOUT_SECS", d.hive.timeout.as_secs())?),
            },
            pipeline: PipelineSettings {
                tta: tta.clamp(1, 5),
                max_edge: parse_var("REALCHECK_MAX_EDGE", d.pipeline.max_edge)?,
                fallback_enabled: bool_var("REALCHECK_IMAGE_FALLBACK", d.pipeline.fallback_enabled)?,
                cache_enabled: bool_var("REALCHECK_CACHE", d.pipeline.cache_enabled)?,
                shaping: Shaping {
                    enabled: bool_var("REALCHECK_SCORE_SHAPING", d.pipeline.shaping.enabled)?,
                    gamma,
                },
                integer_output: bool_var("REALCHECK_RETURN_INTS", d.pipeline.integer_output)?,
            },
        })
    }
}

/// 逗号分隔的模型列表，去空白、去空项
pub fn parse_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// 空字符串等同于未设置
fn string_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn bool_var(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(default),
        Ok(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidValue {
            name,
            value: raw,
            expected: "a boolean (true/false/1/0/yes/no)",
        }),
        Err(_) => Ok(default),
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            expected: "a number",
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "HOST",
        "PORT",
        "HIVE_API_KEY",
        "REALCHECK_HIVE_API_KEY",
        "HIVE_MODELS",
        "HIVE_ENDPOINT",
        "HIVE_TIMEOUT_SECS",
        "REALCHECK_TTA",
        "REALCHECK_MAX_EDGE",
        "REALCHECK_IMAGE_FALLBACK",
        "REALCHECK_CACHE",
        "REALCHECK_CACHE_PATH",
        "REALCHECK_SCORE_SHAPING",
        "REALCHECK_SHAPING_GAMMA",
        "REALCHECK_RETURN_INTS",
        "REALCHECK_FREE_CREDITS",
    ];

    /// 先清空全部相关变量，再设置 `vars`，跑完 `f` 后再清空
    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        VARS.iter().for_each(|k| env::remove_var(k));
        for (k, v) in vars {
            env::set_var(k, v);
        }
        let result = f();
        VARS.iter().for_each(|k| env::remove_var(k));
        result
    }

    #[test]
    #[serial]
    fn from_env_without_variables_uses_defaults() {
        let c = with_env(&[], Config::from_env).unwrap();
        let d = Config::default();
        assert_eq!(c.port, d.port);
        assert_eq!(c.host, d.host);
        assert_eq!(c.cache_path, d.cache_path);
        assert_eq!(c.hive.models, d.hive.models);
        assert!(c.hive.api_key.is_none());
        assert_eq!(c.pipeline.tta, 3);
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        let c = with_env(
            &[
                ("PORT", "8081"),
                ("HIVE_MODELS", "m1, m2"),
                ("HIVE_TIMEOUT_SECS", "5"),
                ("REALCHECK_IMAGE_FALLBACK", "yes"),
                ("REALCHECK_SCORE_SHAPING", "1"),
                ("REALCHECK_SHAPING_GAMMA", "1.5"),
                ("REALCHECK_RETURN_INTS", "false"),
                ("REALCHECK_FREE_CREDITS", "7"),
            ],
            Config::from_env,
        )
        .unwrap();
        assert_eq!(c.port, 8081);
        assert_eq!(c.hive.models, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(c.hive.timeout, Duration::from_secs(5));
        assert!(c.pipeline.fallback_enabled);
        assert!(c.pipeline.shaping.enabled);
        assert_eq!(c.pipeline.shaping.gamma, 1.5);
        assert!(!c.pipeline.integer_output);
        assert_eq!(c.free_credits, 7);
    }

    #[test]
    #[serial]
    fn tta_is_clamped_to_supported_range() {
        let high = with_env(&[("REALCHECK_TTA", "9")], Config::from_env).unwrap();
        assert_eq!(high.pipeline.tta, 5);
        let low = with_env(&[("REALCHECK_TTA", "0")], Config::from_env).unwrap();
        assert_eq!(low.pipeline.tta, 1);
    }

    #[test]
    #[serial]
    fn unparseable_values_are_startup_errors() {
        let err = with_env(&[("PORT", "abc")], Config::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PORT", .. }));

        let err = with_env(&[("REALCHECK_CACHE", "maybe")], Config::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "REALCHECK_CACHE", .. }));

        let err = with_env(&[("REALCHECK_SHAPING_GAMMA", "0")], Config::from_env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "REALCHECK_SHAPING_GAMMA", .. }));
    }

    #[test]
    #[serial]
    fn empty_values_mean_default() {
        let c = with_env(
            &[("PORT", ""), ("REALCHECK_CACHE", " "), ("HOST", ""), ("HIVE_API_KEY", "  ")],
            Config::from_env,
        )
        .unwrap();
        assert_eq!(c.port, 5000);
        assert!(c.pipeline.cache_enabled);
        assert_eq!(c.host, "0.0.0.0");
        assert!(c.hive.api_key.is_none());
    }

    #[test]
    #[serial]
    fn api_key_alias_is_honored() {
        let c = with_env(&[("REALCHECK_HIVE_API_KEY", "secret")], Config::from_env).unwrap();
        assert_eq!(c.hive.api_key.as_deref(), Some("secret"));

        let c = with_env(
            &[("HIVE_API_KEY", "primary"), ("REALCHECK_HIVE_API_KEY", "secret")],
            Config::from_env,
        )
        .unwrap();
        assert_eq!(c.hive.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.port, 5000);
        assert_eq!(c.pipeline.tta, 3);
        assert_eq!(c.pipeline.max_edge, 1024);
        assert!(!c.pipeline.fallback_enabled);
        assert!(c.pipeline.cache_enabled);
        assert!(!c.pipeline.shaping.enabled);
        assert_eq!(c.pipeline.shaping.gamma, 2.5);
        assert!(c.pipeline.integer_output);
        assert_eq!(c.hive.timeout, Duration::from_secs(45));
        assert_eq!(c.hive.models.len(), 3);
        assert!(c.hive.api_key.is_none());
    }

    #[test]
    fn model_list_is_trimmed() {
        assert_eq!(
            parse_models(" a , b,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_models(" , ").is_empty());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        for raw in ["1", "TRUE", "yes", " on "] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "False", "NO", "off"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }
}
