//! realcheck-core：图片真伪打分服务
//!
//! 远程多模型检测为主，本地启发式取证兜底，结果按内容哈希缓存。

pub mod api;
pub mod billing;
pub mod cache;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fingerprint;
pub mod forensics;
pub mod hive;
pub mod pipeline;
pub mod preprocess;
pub mod scoring;
