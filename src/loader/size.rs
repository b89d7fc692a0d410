//! # 尺寸计算模块
//!
//! ## 设计思路
//!
//! 纯函数集合，负责三件事：
//! 1. 解码期降采样率（sample size）：控制解码后缓冲不超过消费端需要的尺寸
//! 2. 解码后精确缩放比例（exact scale）：`Exact` 系列策略下把约束边对齐到目标尺寸
//! 3. 内存缓存键：资源标识 + 目标尺寸
//!
//! ## 实现思路
//!
//! - `FitInside`：两边都要落入目标尺寸；`Crop`：只要有一边落入即可（另一边允许超出，裁剪需要覆盖）。
//! - 无论哪种策略，最终采样率都会再抬高到满足“单边不超过最大位图尺寸”的下限。
//! - 目标尺寸为 0 属于调用方违约，调用前必须先经 `define_target_size` 解析为具体尺寸。

use super::consumer::ConsumerHandle;
use super::source::ImageSize;

/// 最大可解码位图边长的下限。
pub const DEFAULT_MAX_BITMAP_DIMENSION: u32 = 2048;

/// 消费端的填充方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ViewScaleType {
    /// 完整放入目标区域（两边都不超过目标）。
    #[default]
    FitInside,
    /// 铺满目标区域（允许一边超出后被裁剪）。
    Crop,
}

/// 设备/驱动允许的最大位图尺寸。
///
/// 启动时探测一次；探测值小于下限或不可用时使用 `DEFAULT_MAX_BITMAP_DIMENSION`。
pub fn max_bitmap_size(detected_dimension: Option<u32>) -> ImageSize {
    let dimension = detected_dimension
        .unwrap_or(0)
        .max(DEFAULT_MAX_BITMAP_DIMENSION);
    ImageSize::new(dimension, dimension)
}

/// 仅按最大位图尺寸计算的最小采样率。
pub fn compute_min_sample_size(src_size: ImageSize, max_bitmap: ImageSize) -> u32 {
    let width_scale = src_size.width.div_ceil(max_bitmap.width.max(1));
    let height_scale = src_size.height.div_ceil(max_bitmap.height.max(1));
    width_scale.max(height_scale).max(1)
}

/// 计算解码期降采样率。
///
/// 结果恒 ≥ 1；`power_of_2` 为真时恒为 2 的幂。
pub fn compute_sample_size(
    src_size: ImageSize,
    target_size: ImageSize,
    view_scale_type: ViewScaleType,
    power_of_2: bool,
    max_bitmap: ImageSize,
) -> u32 {
    debug_assert!(!target_size.is_empty(), "目标尺寸必须先解析为非 0 值");

    let src_width = src_size.width;
    let src_height = src_size.height;
    let target_width = target_size.width.max(1);
    let target_height = target_size.height.max(1);

    let mut scale: u32 = 1;
    match view_scale_type {
        ViewScaleType::FitInside => {
            if power_of_2 {
                let half_width = src_width / 2;
                let half_height = src_height / 2;
                while half_width / scale > target_width || half_height / scale > target_height {
                    scale *= 2;
                }
            } else {
                scale = (src_width / target_width).max(src_height / target_height);
            }
        }
        ViewScaleType::Crop => {
            if power_of_2 {
                let half_width = src_width / 2;
                let half_height = src_height / 2;
                while half_width / scale > target_width && half_height / scale > target_height {
                    scale *= 2;
                }
            } else {
                scale = (src_width / target_width).min(src_height / target_height);
            }
        }
    }

    let scale = scale.max(1);
    consider_max_bitmap_size(src_width, src_height, scale, power_of_2, max_bitmap)
}

fn consider_max_bitmap_size(
    src_width: u32,
    src_height: u32,
    mut scale: u32,
    power_of_2: bool,
    max_bitmap: ImageSize,
) -> u32 {
    let max_width = max_bitmap.width.max(1);
    let max_height = max_bitmap.height.max(1);
    while src_width / scale > max_width || src_height / scale > max_height {
        if power_of_2 {
            scale *= 2;
        } else {
            scale += 1;
        }
    }
    scale
}

/// 计算解码后的精确缩放比例。
///
/// `stretch` 为假时只缩小不放大；比例不会缩小图片时返回 1.0。
pub fn compute_exact_scale(
    src_size: ImageSize,
    target_size: ImageSize,
    view_scale_type: ViewScaleType,
    stretch: bool,
) -> f32 {
    debug_assert!(!target_size.is_empty(), "目标尺寸必须先解析为非 0 值");

    let src_width = src_size.width;
    let src_height = src_size.height;
    let target_width = target_size.width.max(1);
    let target_height = target_size.height.max(1);

    let width_scale = src_width as f32 / target_width as f32;
    let height_scale = src_height as f32 / target_height as f32;

    let (dest_width, dest_height) = if (view_scale_type == ViewScaleType::FitInside
        && width_scale >= height_scale)
        || (view_scale_type == ViewScaleType::Crop && width_scale < height_scale)
    {
        (target_width, (src_height as f32 / width_scale) as u32)
    } else {
        ((src_width as f32 / height_scale) as u32, target_height)
    };

    let shrinks = dest_width < src_width && dest_height < src_height;
    let changes = dest_width != src_width && dest_height != src_height;
    if (!stretch && shrinks) || (stretch && changes) {
        dest_width as f32 / src_width as f32
    } else {
        1.0
    }
}

/// 解析消费端的目标尺寸：消费端已测量的边优先，否则使用兜底尺寸。
pub fn define_target_size(consumer: &dyn ConsumerHandle, fallback: ImageSize) -> ImageSize {
    let width = match consumer.width() {
        0 => fallback.width,
        width => width,
    };
    let height = match consumer.height() {
        0 => fallback.height,
        height => height,
    };
    ImageSize::new(width, height)
}

/// 生成内存缓存键：`{uri}_{width}x{height}`。
pub fn generate_key(uri: &str, target_size: ImageSize) -> String {
    format!("{}_{}x{}", uri, target_size.width, target_size.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CAP: ImageSize = ImageSize::new(DEFAULT_MAX_BITMAP_DIMENSION, DEFAULT_MAX_BITMAP_DIMENSION);

    fn size(width: u32, height: u32) -> ImageSize {
        ImageSize::new(width, height)
    }

    #[test]
    fn fit_power_of_two_sample() {
        let sample = compute_sample_size(size(100, 100), size(10, 10), ViewScaleType::FitInside, true, CAP);
        assert_eq!(sample, 8);
    }

    #[test]
    fn fit_integer_sample() {
        let sample = compute_sample_size(size(100, 100), size(10, 10), ViewScaleType::FitInside, false, CAP);
        assert_eq!(sample, 10);
        let sample = compute_sample_size(size(100, 100), size(20, 40), ViewScaleType::FitInside, false, CAP);
        assert_eq!(sample, 5);
    }

    #[test]
    fn crop_only_needs_one_axis_within_target() {
        let sample = compute_sample_size(size(100, 100), size(20, 40), ViewScaleType::Crop, false, CAP);
        assert_eq!(sample, 2);
    }

    #[test]
    fn upscale_target_yields_unit_sample() {
        let sample = compute_sample_size(size(10, 10), size(200, 200), ViewScaleType::FitInside, false, CAP);
        assert_eq!(sample, 1);
    }

    #[test]
    fn sample_respects_max_bitmap_size() {
        let cap = size(2048, 2048);
        let sample = compute_sample_size(size(10_000, 100), size(10_000, 10_000), ViewScaleType::FitInside, false, cap);
        assert!(10_000 / sample <= 2048);
        assert_eq!(compute_min_sample_size(size(10_000, 100), cap), 5);
    }

    #[test]
    fn min_sample_is_one_for_small_images() {
        assert_eq!(compute_min_sample_size(size(640, 480), CAP), 1);
    }

    #[test]
    fn max_bitmap_size_never_below_floor() {
        assert_eq!(max_bitmap_size(Some(1024)), CAP);
        assert_eq!(max_bitmap_size(None), CAP);
        assert_eq!(max_bitmap_size(Some(4096)), size(4096, 4096));
    }

    #[test]
    fn exact_scale_shrinks_to_target() {
        let scale = compute_exact_scale(size(40, 40), size(10, 10), ViewScaleType::FitInside, false);
        assert!((scale - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn exact_scale_never_upscales_without_stretch() {
        let scale = compute_exact_scale(size(10, 10), size(20, 20), ViewScaleType::FitInside, false);
        assert!((scale - 1.0).abs() < f32::EPSILON);
        let stretched = compute_exact_scale(size(10, 10), size(20, 20), ViewScaleType::FitInside, true);
        assert!((stretched - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn crop_exact_scale_uses_larger_ratio() {
        // 100x50 填充 20x20：高度是约束边，比例 20/50
        let scale = compute_exact_scale(size(100, 50), size(20, 20), ViewScaleType::Crop, false);
        assert!((scale - 0.4).abs() < 1e-6);
    }

    #[test]
    fn cache_key_distinguishes_sizes() {
        let uri = "https://example.com/a.png";
        assert_eq!(generate_key(uri, size(10, 20)), generate_key(uri, size(10, 20)));
        assert_ne!(generate_key(uri, size(10, 20)), generate_key(uri, size(20, 10)));
        assert_eq!(generate_key(uri, size(10, 20)), "https://example.com/a.png_10x20");
    }

    proptest! {
        #[test]
        fn sample_size_is_positive_and_power_of_two(
            src_w in 1u32..20_000,
            src_h in 1u32..20_000,
            dst_w in 1u32..4_000,
            dst_h in 1u32..4_000,
            crop in any::<bool>(),
        ) {
            let view = if crop { ViewScaleType::Crop } else { ViewScaleType::FitInside };
            let sample = compute_sample_size(size(src_w, src_h), size(dst_w, dst_h), view, true, CAP);
            prop_assert!(sample >= 1);
            prop_assert!(sample.is_power_of_two());
            prop_assert!(src_w / sample <= CAP.width && src_h / sample <= CAP.height);
        }

        #[test]
        fn integer_sample_size_is_positive(
            src_w in 1u32..20_000,
            src_h in 1u32..20_000,
            dst_w in 1u32..4_000,
            dst_h in 1u32..4_000,
            crop in any::<bool>(),
        ) {
            let view = if crop { ViewScaleType::Crop } else { ViewScaleType::FitInside };
            let sample = compute_sample_size(size(src_w, src_h), size(dst_w, dst_h), view, false, CAP);
            prop_assert!(sample >= 1);
        }
    }
}
