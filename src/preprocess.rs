use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, ImageResult, Rgb, RgbImage};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use tracing::debug;

/// 变体统一编码质量
pub const VARIANT_JPEG_QUALITY: u8 = 95;
/// TTA 旋转角度 (度)
const TTA_ROTATION_DEG: f32 = 5.0;
pub const MAX_TTA: u8 = 5;

/// 发往远程检测器的一组变体
#[derive(Debug, Clone)]
pub struct VariantBatch {
    /// 每个变体的 base64(JPEG) 编码，顺序固定
    pub variants: Vec<String>,
    /// 诊断用的预处理说明
    pub description: String,
    /// false 表示解码失败，直接透传了原始字节
    pub processed: bool,
}

/// 标准化预处理 + TTA 变体生成。
///
/// 顺序：原图 -> 水平镜像 (tta>=2) -> 垂直翻转 (tta>=3) -> +5° (tta>=4) -> -5° (tta>=5)。
/// 任何解码/编码失败都退回到 "原始字节作为唯一变体"，这一步永远不会失败。
pub fn prepare_variants(bytes: &[u8], max_edge: u32, tta: u8) -> VariantBatch {
    match render_variants(bytes, max_edge, tta) {
        Ok((variants, (w, h))) => {
            let description = format!(
                "standardized RGB JPEG q{} {}x{} (TTA={})",
                VARIANT_JPEG_QUALITY,
                w,
                h,
                variants.len()
            );
            VariantBatch {
                variants,
                description,
                processed: true,
            }
        }
        Err(e) => {
            debug!(error = %e, "preprocessing failed, sending raw bytes");
            VariantBatch {
                variants: vec![STANDARD.encode(bytes)],
                description: "raw file base64 (unprocessed)".to_string(),
                processed: false,
            }
        }
    }
}

fn render_variants(bytes: &[u8], max_edge: u32, tta: u8) -> ImageResult<(Vec<String>, (u32, u32))> {
    let base = downscale(image::load_from_memory(bytes)?.to_rgb8(), max_edge);
    let size = base.dimensions();

    let variants = tta_images(&base, tta)
        .iter()
        .map(|img| encode_jpeg(img, VARIANT_JPEG_QUALITY).map(|jpeg| STANDARD.encode(jpeg)))
        .collect::<ImageResult<Vec<_>>>()?;

    Ok((variants, size))
}

/// 长边超过上限时等比缩小，使长边恰好等于上限
pub fn downscale(img: RgbImage, max_edge: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let long = w.max(h);
    if max_edge == 0 || long <= max_edge {
        return img;
    }

    let scale = max_edge as f64 / long as f64;
    let (nw, nh) = if w >= h {
        (max_edge, ((h as f64 * scale).round() as u32).max(1))
    } else {
        (((w as f64 * scale).round() as u32).max(1), max_edge)
    };
    imageops::resize(&img, nw, nh, FilterType::CatmullRom)
}

/// 生成 TTA 图像序列，数量 = clamp(tta, 1, 5)
pub fn tta_images(base: &RgbImage, tta: u8) -> Vec<RgbImage> {
    let count = tta.clamp(1, MAX_TTA);
    let mut imgs = Vec::with_capacity(count as usize);

    imgs.push(base.clone());
    if count >= 2 {
        imgs.push(imageops::flip_horizontal(base));
    }
    if count >= 3 {
        imgs.push(imageops::flip_vertical(base));
    }
    // imageproc 的 theta 是顺时针弧度，+5° 指逆时针，所以取负
    if count >= 4 {
        imgs.push(rotate(base, TTA_ROTATION_DEG));
    }
    if count >= 5 {
        imgs.push(rotate(base, -TTA_ROTATION_DEG));
    }
    imgs
}

fn rotate(img: &RgbImage, ccw_degrees: f32) -> RgbImage {
    rotate_about_center(
        img,
        -ccw_degrees.to_radians(),
        Interpolation::Bicubic,
        Rgb([0, 0, 0]),
    )
}

/// RGB -> JPEG 字节 (指定质量)
pub fn encode_jpeg(img: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img.clone()).write_to(&mut buf, ImageOutputFormat::Jpeg(quality))?;
    Ok(buf)
}
