//! 本地启发式取证 (Local Forensics Analyzer)
//!
//! 远程检测不可用时的兜底路径。五个互相独立的信号，确定性地累加成一个 fake 分数：
//!
//! 1. ELA：JPEG q95 重压缩后的差分 (放大 10 倍)
//! 2. EXIF 里的生成式工具关键词
//! 3. 锐度：灰度拉普拉斯方差，过低说明过度平滑
//! 4. 高频能量占比 (2D FFT)
//! 5. pHash 稳定性：q85 重压缩前后的汉明距离

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, RgbImage};
use rustfft::{num_complex::Complex, FftPlanner};
use thiserror::Error;
use tracing::debug;

use crate::evidence::{DetectionResult, Source};
use crate::fingerprint;
use crate::preprocess::{downscale, encode_jpeg};

/// 取证前把长边限制在这个范围内，ELA 重压缩和 FFT 的开销随像素数增长
pub const ANALYSIS_MAX_EDGE: u32 = 2048;

const ELA_QUALITY: u8 = 95;
const ELA_AMPLIFY: f64 = 10.0;
const PHASH_QUALITY: u8 = 85;

/// 与生成式 AI 工具相关的元数据关键词
pub const AI_HINT_KEYWORDS: &[&str] = &[
    "stable diffusion",
    "midjourney",
    "dall-e",
    "dalle",
    "sdxl",
    "generative",
    "ai",
    "diffusion",
    "comfyui",
    "invokeai",
];

pub const MSG_AUTHENTIC: &str = "likely authentic";
pub const MSG_AI: &str = "strong AI-generation indicators";
pub const MSG_MIXED: &str = "mixed signals, further review advised";

#[derive(Debug, Error)]
pub enum ForensicsError {
    /// 内容嗅探和按扩展名解码都失败了
    #[error("image could not be decoded: {primary}; fallback by extension: {fallback}")]
    Decode { primary: String, fallback: String },

    #[error("recompression failed: {0}")]
    Recompress(#[from] ImageError),
}

/// 元数据扫描结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataHints {
    /// 是否读到了任何 EXIF 字段
    pub present: bool,
    /// 命中的关键词 (按关键词表顺序)
    pub hits: Vec<&'static str>,
}

/// 五个原始测量值
#[derive(Debug, Clone, PartialEq)]
pub struct ForensicSignals {
    pub ela_mean: f64,
    pub ela_max: f64,
    pub metadata: MetadataHints,
    pub sharpness: f64,
    pub high_freq_ratio: f64,
    pub phash_distance: u32,
}

impl ForensicSignals {
    /// 启发式组合，结果夹到 [0, 100]。各项累加与顺序无关。
    pub fn fake_score(&self) -> f64 {
        let mut fake = 0.0;

        // ELA 均值高 -> 更像伪造 (最多约 25)
        fake += (self.ela_mean / 8.0 * 25.0).min(100.0);

        if !self.metadata.hits.is_empty() {
            fake += 30.0;
        }

        // 高频占比过低/过高都不自然
        if self.high_freq_ratio < 0.50 {
            fake += (0.50 - self.high_freq_ratio) * 60.0;
        } else if self.high_freq_ratio > 0.85 {
            fake += (self.high_freq_ratio - 0.85) * 80.0;
        }

        if self.sharpness < 20.0 {
            fake += 20.0 - self.sharpness;
        }

        fake += match self.phash_distance {
            d if d > 15 => 15.0,
            d if d > 8 => 8.0,
            d if d > 4 => 4.0,
            _ => 0.0,
        };

        fake.clamp(0.0, 100.0)
    }

    pub fn details(&self) -> Vec<String> {
        let mut details = vec![
            format!("ELA mean/max: {:.2} / {:.2}", self.ela_mean, self.ela_max),
            format!("Sharpness (Laplacian variance): {:.1}", self.sharpness),
            format!("High-frequency ratio: {:.3}", self.high_freq_ratio),
            format!("pHash distance: {}", self.phash_distance),
        ];
        details.push(if !self.metadata.hits.is_empty() {
            format!("Metadata AI hints: {}", self.metadata.hits.join(", "))
        } else if self.metadata.present {
            "Metadata present: no AI hints found".to_string()
        } else {
            "No metadata (neutral)".to_string()
        });
        details
    }
}

pub fn verdict_message(real: f64) -> &'static str {
    if real >= 70.0 {
        MSG_AUTHENTIC
    } else if real <= 30.0 {
        MSG_AI
    } else {
        MSG_MIXED
    }
}

/// 取证主入口：解码 -> 限制尺寸 -> 五个信号 -> 组合成 DetectionResult
pub fn analyze(bytes: &[u8], filename: &str) -> Result<DetectionResult, ForensicsError> {
    let rgb = working_copy(&decode(bytes, filename)?);
    let signals = measure(&rgb, bytes)?;

    let fake = signals.fake_score();
    let real = 100.0 - fake;
    debug!(real, fake, ?signals, "forensics scored");

    Ok(DetectionResult {
        real,
        fake,
        message: verdict_message(real).to_string(),
        details: signals.details(),
        source: Source::Forensics,
    })
}

/// 鲁棒解码：先按内容嗅探，失败再按文件扩展名指定格式解一次。
/// 动图 (GIF/WebP) 只取第一帧。
pub fn decode(bytes: &[u8], filename: &str) -> Result<DynamicImage, ForensicsError> {
    let primary = match image::load_from_memory(bytes) {
        Ok(img) => return Ok(DynamicImage::ImageRgb8(img.to_rgb8())),
        Err(e) => e,
    };

    let fallback = ImageFormat::from_path(filename)
        .and_then(|format| image::load_from_memory_with_format(bytes, format));
    match fallback {
        Ok(img) => Ok(DynamicImage::ImageRgb8(img.to_rgb8())),
        Err(e) => Err(ForensicsError::Decode {
            primary: primary.to_string(),
            fallback: e.to_string(),
        }),
    }
}

/// RGB 副本，长边超过 `ANALYSIS_MAX_EDGE` 时等比缩小
pub fn working_copy(img: &DynamicImage) -> RgbImage {
    let (w, h) = (img.width(), img.height());
    if w.max(h) > ANALYSIS_MAX_EDGE {
        debug!(width = w, height = h, max_edge = ANALYSIS_MAX_EDGE, "downscaling before forensics");
    }
    downscale(img.to_rgb8(), ANALYSIS_MAX_EDGE)
}

/// 计算全部原始信号。`raw` 是上传的原始字节 (EXIF 只能从容器里读)。
pub fn measure(rgb: &RgbImage, raw: &[u8]) -> Result<ForensicSignals, ForensicsError> {
    let gray = GrayPlane::from_rgb(rgb);

    let (ela_mean, ela_max) = ela(rgb)?;

    Ok(ForensicSignals {
        ela_mean,
        ela_max,
        metadata: metadata_hints(raw),
        sharpness: laplacian_variance(&gray),
        high_freq_ratio: high_freq_ratio(&gray),
        phash_distance: phash_stability(rgb),
    })
}

// ==========================================
// 1. ELA
// ==========================================

/// 返回 (均值, 最大值)，统计范围是全部像素的全部通道
pub fn ela(rgb: &RgbImage) -> Result<(f64, f64), ForensicsError> {
    let jpeg = encode_jpeg(rgb, ELA_QUALITY)?;
    let recompressed = image::load_from_memory(&jpeg)?.to_rgb8();

    let (mut sum, mut max) = (0.0f64, 0.0f64);
    let mut n = 0usize;
    for (a, b) in rgb.as_raw().iter().zip(recompressed.as_raw().iter()) {
        let diff = ((*a as f64 - *b as f64).abs() * ELA_AMPLIFY).min(255.0);
        sum += diff;
        max = max.max(diff);
        n += 1;
    }
    if n == 0 {
        return Ok((0.0, 0.0));
    }
    Ok((sum / n as f64, max))
}

// ==========================================
// 2. 元数据
// ==========================================

/// 读 EXIF -> "tag:value" 小写拼接 -> 扫关键词。读不到 EXIF 不算错误。
pub fn metadata_hints(raw: &[u8]) -> MetadataHints {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(raw)) {
        Ok(exif) => exif,
        Err(e) => {
            debug!(error = %e, "no readable EXIF");
            return MetadataHints::default();
        }
    };

    let present = exif.fields().next().is_some();
    let text = exif
        .fields()
        .map(|f| format!("{}:{}", f.tag, f.display_value()))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    MetadataHints {
        present,
        hits: scan_keywords(&text),
    }
}

/// 关键词扫描。三个字符以内的短词 (如 "ai") 必须整词命中，否则 "gaincontrol" 这类标签名会误报。
pub fn scan_keywords(text: &str) -> Vec<&'static str> {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    AI_HINT_KEYWORDS
        .iter()
        .copied()
        .filter(|kw| {
            if kw.len() <= 3 {
                words.contains(kw)
            } else {
                text.contains(kw)
            }
        })
        .collect()
}

// ==========================================
// 3. 灰度平面 + 锐度
// ==========================================

/// f64 灰度平面 (BT.601 加权，取整到 0..=255)
pub struct GrayPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl GrayPlane {
    pub fn from_rgb(rgb: &RgbImage) -> Self {
        let (w, h) = rgb.dimensions();
        let data = rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64).round()
            })
            .collect();
        Self {
            width: w as usize,
            height: h as usize,
            data,
        }
    }

    fn at(&self, x: isize, y: isize) -> f64 {
        let x = reflect_101(x, self.width);
        let y = reflect_101(y, self.height);
        self.data[y * self.width + x]
    }
}

/// 边界反射 (不重复边缘像素)：-1 -> 1, n -> n-2
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let mut i = i;
    if i < 0 {
        i = -i;
    }
    if i >= n {
        i = 2 * (n - 1) - i;
    }
    i.clamp(0, n - 1) as usize
}

/// 4 邻域拉普拉斯 [0,1,0; 1,-4,1; 0,1,0] 的方差
pub fn laplacian_variance(gray: &GrayPlane) -> f64 {
    let n = gray.width * gray.height;
    if n == 0 {
        return 0.0;
    }

    let mut values = Vec::with_capacity(n);
    for y in 0..gray.height as isize {
        for x in 0..gray.width as isize {
            let v = gray.at(x - 1, y) + gray.at(x + 1, y) + gray.at(x, y - 1) + gray.at(x, y + 1)
                - 4.0 * gray.at(x, y);
            values.push(v);
        }
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
}

// ==========================================
// 4. 高频占比
// ==========================================

/// 2D FFT 后 (中心化)，log1p 幅值谱中落在中心低频圆盘之外的能量占比。
/// 圆盘半径 = min(h/2, w/2) / 2。
pub fn high_freq_ratio(gray: &GrayPlane) -> f64 {
    let (w, h) = (gray.width, gray.height);
    if w == 0 || h == 0 {
        return 0.0;
    }

    let mut buf: Vec<Complex<f64>> = gray.data.iter().map(|&v| Complex::new(v, 0.0)).collect();
    let mut planner = FftPlanner::<f64>::new();

    // 行变换：process 按长度 w 分块处理整个缓冲区
    planner.plan_fft_forward(w).process(&mut buf);

    // 列变换：逐列 gather -> FFT -> scatter
    let col_fft = planner.plan_fft_forward(h);
    let mut column = vec![Complex::new(0.0, 0.0); h];
    for x in 0..w {
        for y in 0..h {
            column[y] = buf[y * w + x];
        }
        col_fft.process(&mut column);
        for y in 0..h {
            buf[y * w + x] = column[y];
        }
    }

    let (cy, cx) = (h / 2, w / 2);
    let r = (cy.min(cx) / 2) as isize;

    let mut total = 0.0;
    let mut center = 0.0;
    // 遍历中心化后的坐标 (sy, sx)，对应原频谱索引做 fftshift 逆映射
    for sy in 0..h {
        let oy = (sy + h - cy) % h;
        for sx in 0..w {
            let ox = (sx + w - cx) % w;
            let mag = buf[oy * w + ox].norm().ln_1p();
            total += mag;

            let dy = sy as isize - cy as isize;
            let dx = sx as isize - cx as isize;
            if dy * dy + dx * dx <= r * r {
                center += mag;
            }
        }
    }

    let total = total + 1e-6;
    (total - center) / total
}

// ==========================================
// 5. pHash 稳定性
// ==========================================

/// q85 重压缩前后的 pHash 汉明距离。这个信号失败时记为 0，不影响其他信号。
pub fn phash_stability(rgb: &RgbImage) -> u32 {
    let recompressed = encode_jpeg(rgb, PHASH_QUALITY)
        .and_then(|jpeg| image::load_from_memory(&jpeg));
    match recompressed {
        Ok(comp) => fingerprint::phash_distance(&DynamicImage::ImageRgb8(rgb.clone()), &comp),
        Err(e) => {
            debug!(error = %e, "pHash recompression failed, distance treated as 0");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([120, 130, 140]))
    }

    fn signals(overrides: impl FnOnce(&mut ForensicSignals)) -> ForensicSignals {
        let mut s = ForensicSignals {
            ela_mean: 0.0,
            ela_max: 0.0,
            metadata: MetadataHints::default(),
            sharpness: 500.0,
            high_freq_ratio: 0.7,
            phash_distance: 0,
        };
        overrides(&mut s);
        s
    }

    #[test]
    fn solid_image_is_oversmoothed_and_not_authentic() {
        let jpeg = encode_jpeg(&solid(64, 64), 95).unwrap();
        let result = analyze(&jpeg, "solid.jpg").unwrap();

        let img = decode(&jpeg, "solid.jpg").unwrap();
        let s = measure(&working_copy(&img), &jpeg).unwrap();
        assert!(s.sharpness < 1.0, "sharpness {}", s.sharpness);
        assert!(s.high_freq_ratio < 0.1);
        assert!(s.metadata.hits.is_empty());
        assert!(!s.metadata.present);

        assert_eq!(result.source, Source::Forensics);
        assert_ne!(result.message, MSG_AUTHENTIC);
        assert!((result.real + result.fake - 100.0).abs() < 1e-9);
        assert!(result.details.iter().any(|d| d == "No metadata (neutral)"));
    }

    #[test]
    fn clean_signals_read_as_authentic() {
        let s = signals(|_| {});
        assert_eq!(s.fake_score(), 0.0);
        assert_eq!(verdict_message(100.0 - s.fake_score()), MSG_AUTHENTIC);
    }

    #[test]
    fn combination_terms_add_up() {
        let s = signals(|s| {
            s.ela_mean = 4.0; // +12.5
            s.metadata.hits = vec!["midjourney"]; // +30
            s.high_freq_ratio = 0.40; // +6
            s.sharpness = 15.0; // +5
            s.phash_distance = 9; // +8
        });
        assert!((s.fake_score() - 61.5).abs() < 1e-9);
        assert_eq!(verdict_message(100.0 - s.fake_score()), MSG_MIXED);
    }

    #[test]
    fn high_frequency_excess_is_penalized() {
        let s = signals(|s| s.high_freq_ratio = 0.95);
        assert!((s.fake_score() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn fake_score_is_clamped() {
        let s = signals(|s| {
            s.ela_mean = 1000.0;
            s.metadata.hits = vec!["sdxl"];
            s.sharpness = 0.0;
            s.high_freq_ratio = 0.0;
            s.phash_distance = 40;
        });
        assert_eq!(s.fake_score(), 100.0);
        assert_eq!(verdict_message(0.0), MSG_AI);
    }

    #[test]
    fn short_keywords_need_whole_words() {
        assert!(scan_keywords("gaincontrol:normal software:acme").is_empty());
        assert_eq!(scan_keywords("software:ai image tool"), vec!["ai"]);
        assert_eq!(
            scan_keywords("software:stable diffusion xl"),
            vec!["stable diffusion", "diffusion"]
        );
    }

    #[test]
    fn noise_has_higher_sharpness_than_flat() {
        // 线性同余伪随机噪声，频谱铺满
        let mut state: u32 = 12345;
        let noisy = RgbImage::from_fn(32, 32, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let v = (state >> 16) as u8;
            Rgb([v, v, v])
        });
        let flat = GrayPlane::from_rgb(&solid(32, 32));
        assert_eq!(laplacian_variance(&flat), 0.0);
        assert!(laplacian_variance(&GrayPlane::from_rgb(&noisy)) > 1000.0);
        assert!(high_freq_ratio(&GrayPlane::from_rgb(&noisy)) > 0.5);
    }

    #[test]
    fn undecodable_input_is_a_fatal_error() {
        let err = analyze(b"plain text", "fake.png").unwrap_err();
        assert!(matches!(err, ForensicsError::Decode { .. }));
    }

    /// 手工拼一个只有 Software 标签的 EXIF APP1 段，插在 SOI 之后
    fn with_software_tag(jpeg: &[u8], software: &str) -> Vec<u8> {
        let mut value = software.as_bytes().to_vec();
        value.push(0);

        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"II");
        tiff.extend_from_slice(&42u16.to_le_bytes());
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&1u16.to_le_bytes()); // 一个 IFD 条目
        tiff.extend_from_slice(&0x0131u16.to_le_bytes()); // Software
        tiff.extend_from_slice(&2u16.to_le_bytes()); // ASCII
        tiff.extend_from_slice(&(value.len() as u32).to_le_bytes());
        tiff.extend_from_slice(&26u32.to_le_bytes()); // 8 + 2 + 12 + 4
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(&value);

        let mut out = jpeg[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
        out.extend_from_slice(b"Exif\0\0");
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn exif_software_tag_is_scanned_for_keywords() {
        let jpeg = encode_jpeg(&solid(32, 32), 95).unwrap();
        let tagged = with_software_tag(&jpeg, "Midjourney v6");

        let hints = metadata_hints(&tagged);
        assert!(hints.present);
        assert_eq!(hints.hits, vec!["midjourney"]);

        let result = analyze(&tagged, "tagged.jpg").unwrap();
        assert!(result.details.iter().any(|d| d.contains("midjourney")), "{:?}", result.details);
    }

    #[test]
    fn oversized_images_are_bounded_before_measuring() {
        let wide = DynamicImage::ImageRgb8(RgbImage::from_fn(ANALYSIS_MAX_EDGE * 2, 64, |x, y| {
            Rgb([(x % 256) as u8, (y * 4) as u8, 90])
        }));
        let bounded = working_copy(&wide);
        assert_eq!(bounded.dimensions(), (ANALYSIS_MAX_EDGE, 32));

        let small = DynamicImage::ImageRgb8(solid(40, 30));
        assert_eq!(working_copy(&small).dimensions(), (40, 30));
    }

    #[test]
    fn reflect_101_borders() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-1, 1), 0);
    }
}
