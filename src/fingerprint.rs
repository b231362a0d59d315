use image::DynamicImage;
use img_hash::{HashAlg, HasherConfig}; // pHash 配置器和算法枚举
use sha2::{Digest, Sha256}; // SHA2 算法和 Digest 特性(方法集)
use std::path::Path;

/// 允许进入检测流程的扩展名 (小写，不含点)。
/// 不在名单里的一律按 "unsupported type" 拒绝，检测器根本不会被调用。
pub const ALLOWED_IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "jfif", "png", "webp", "bmp", "gif", "tif", "tiff", "heic", "heif", "avif",
    "jp2", "j2k", "jpf", "jpx", "ico",
];

/// 内容哈希 (ContentHash)
///
/// SHA-256 -> 64 字符小写 Hex。结果缓存的 key，只取决于字节本身，与文件名无关。
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    // 32 字节摘要 -> 64 位小写十六进制
    hex::encode(hasher.finalize())
}

/// 文件扩展名 (小写)。没有扩展名返回 None。
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// 扩展名白名单检查
pub fn is_allowed_image(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| ALLOWED_IMAGE_EXTS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// 两张图的感知哈希汉明距离 (64 位 DCT pHash)。
///
/// `HashAlg::Mean + preproc_dct` 就是经典 pHash：缩小 -> 灰度 -> DCT -> 与均值比较。
/// 距离越大说明视觉内容越不稳定。
pub fn phash_distance(a: &DynamicImage, b: &DynamicImage) -> u32 {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .hash_size(8, 8)
        .to_hasher();

    let ha = hasher.hash_image(a);
    let hb = hasher.hash_image(b);
    ha.dist(&hb)
}
