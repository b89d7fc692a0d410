//! # 解码模块
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → RGBA 缓冲”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 读取全部字节（受体积上限约束），猜测格式并读取 header 尺寸与 EXIF 方向
//! 2. 按像素 / 内存上限快速拒绝
//! 3. 完整解码
//! 4. 按缩放策略计算采样率，`Exact` 系列再叠加精确缩放，合并为一次 resize
//! 5. 按方向信息旋转 / 翻转，输出 RGBA

use std::io::Cursor;

use fast_image_resize as fr;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder as _, ImageReader, RgbaImage};

use super::config::{LoaderConfig, ResizeFilter};
use super::options::ImageScaleType;
use super::size::{self, ViewScaleType};
use super::source::{DecodedBuffer, ImageSize, SourceStream};
use super::ImageError;

/// 单次解码所需的上下文。
#[derive(Debug, Clone)]
pub struct DecodingInfo {
    /// 内存缓存键，仅用于日志。
    pub cache_key: String,
    pub target_size: ImageSize,
    pub view_scale_type: ViewScaleType,
    pub scale_type: ImageScaleType,
    pub consider_exif: bool,
}

/// 把字节流解码为已按目标尺寸处理过的缓冲。
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, stream: SourceStream, info: &DecodingInfo) -> Result<DecodedBuffer, ImageError>;
}

/// 资源上限。
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    pub max_file_size: u64,
    pub max_decoded_pixels: u64,
    pub max_decoded_bytes: u64,
}

/// 基于 `image` + `fast_image_resize` 的默认解码器。
#[derive(Debug, Clone)]
pub struct BaseImageDecoder {
    limits: DecodeLimits,
    filter: ResizeFilter,
    max_bitmap: ImageSize,
}

impl BaseImageDecoder {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            limits: DecodeLimits {
                max_file_size: config.max_file_size,
                max_decoded_pixels: config.max_decoded_pixels,
                max_decoded_bytes: config.max_decoded_bytes,
            },
            filter: config.resize_filter,
            max_bitmap: size::max_bitmap_size(config.max_texture_dimension),
        }
    }

    fn validate_limits(&self, width: u32, height: u32) -> Result<(), ImageError> {
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| ImageError::ResourceLimit("图片像素数溢出".to_string()))?;

        if pixels > self.limits.max_decoded_pixels {
            return Err(ImageError::ResourceLimit(format!(
                "图片像素过大：{} 像素（限制：{} 像素）",
                pixels, self.limits.max_decoded_pixels
            )));
        }

        let estimated = pixels
            .checked_mul(4)
            .ok_or_else(|| ImageError::ResourceLimit("图片解码内存估算溢出".to_string()))?;
        if estimated > self.limits.max_decoded_bytes {
            return Err(ImageError::ResourceLimit(format!(
                "图片解码预计内存过大：{:.2} MB（限制：{:.2} MB）",
                estimated as f64 / 1024.0 / 1024.0,
                self.limits.max_decoded_bytes as f64 / 1024.0 / 1024.0
            )));
        }

        Ok(())
    }

    fn sample_size(&self, src_size: ImageSize, info: &DecodingInfo) -> u32 {
        match info.scale_type {
            ImageScaleType::None => 1,
            ImageScaleType::NoneSafe => size::compute_min_sample_size(src_size, self.max_bitmap),
            ImageScaleType::PowerOf2 => size::compute_sample_size(
                src_size,
                info.target_size,
                info.view_scale_type,
                true,
                self.max_bitmap,
            ),
            ImageScaleType::Integer | ImageScaleType::Exact | ImageScaleType::ExactStretched => {
                size::compute_sample_size(
                    src_size,
                    info.target_size,
                    info.view_scale_type,
                    false,
                    self.max_bitmap,
                )
            }
        }
    }

    /// 计算解码后（未旋转坐标系下）的输出尺寸。
    fn output_size(&self, raw_size: ImageSize, rotated: bool, info: &DecodingInfo) -> (ImageSize, u32) {
        let oriented = |size: ImageSize| {
            if rotated {
                ImageSize::new(size.height, size.width)
            } else {
                size
            }
        };

        let sample_size = self.sample_size(oriented(raw_size), info);
        let mut output = raw_size.scale_down(sample_size);

        if info.scale_type.is_exact() {
            let stretch = info.scale_type == ImageScaleType::ExactStretched;
            let scale = size::compute_exact_scale(
                oriented(output),
                info.target_size,
                info.view_scale_type,
                stretch,
            );
            if (scale - 1.0).abs() > f32::EPSILON {
                output = output.scale(scale);
            }
        }

        (output, sample_size)
    }
}

impl ImageDecoder for BaseImageDecoder {
    fn decode(&self, stream: SourceStream, info: &DecodingInfo) -> Result<DecodedBuffer, ImageError> {
        let bytes = stream.read_all_with_limit(self.limits.max_file_size)?;

        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| ImageError::InvalidFormat(format!("无法识别图片格式：{}", e)))?;
        if reader.format().is_none() {
            return Err(ImageError::InvalidFormat("无法识别图片格式".to_string()));
        }

        let mut decoder = reader.into_decoder()?;
        let (raw_width, raw_height) = decoder.dimensions();
        self.validate_limits(raw_width, raw_height)?;

        let orientation = if info.consider_exif {
            decoder.orientation().unwrap_or(Orientation::NoTransforms)
        } else {
            Orientation::NoTransforms
        };
        let rotated = matches!(
            orientation,
            Orientation::Rotate90
                | Orientation::Rotate270
                | Orientation::Rotate90FlipH
                | Orientation::Rotate270FlipH
        );

        let decoded = DynamicImage::from_decoder(decoder)?;
        let raw_size = ImageSize::new(decoded.width(), decoded.height());
        let (output, sample_size) = self.output_size(raw_size, rotated, info);

        let mut image = if output == raw_size {
            decoded
        } else {
            resize(decoded, output, self.filter)
        };
        image.apply_orientation(orientation);

        let buffer = DecodedBuffer::from_image(image);
        log::debug!(
            "🧩 解码完成 [{}] 原始尺寸: {} 采样率: {} 输出尺寸: {} 方向: {:?}",
            info.cache_key,
            raw_size,
            sample_size,
            buffer.size(),
            orientation
        );
        Ok(buffer)
    }
}

/// 缩放到指定尺寸；`fast_image_resize` 失败时回退 `image::resize_exact`。
fn resize(image: DynamicImage, target: ImageSize, filter: ResizeFilter) -> DynamicImage {
    match resize_with_fast_image_resize(&image, target, filter) {
        Ok(resized) => resized,
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}", err);
            image.resize_exact(target.width, target.height, filter.to_image_filter())
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target: ImageSize,
    filter: ResizeFilter,
) -> Result<DynamicImage, ImageError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(src_width, src_height, src.into_raw(), fr::PixelType::U8x4)
        .map_err(|e| ImageError::Decode(format!("构建源图像缓冲失败：{}", e)))?;
    let mut dst_image = fr::images::Image::new(target.width, target.height, fr::PixelType::U8x4);

    let options = fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(filter.to_fast_filter()));
    fr::Resizer::new()
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ImageError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    let rgba = RgbaImage::from_raw(target.width, target.height, dst_image.into_vec())
        .ok_or_else(|| ImageError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))?;
    Ok(DynamicImage::ImageRgba8(rgba))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    fn info(target: ImageSize, scale_type: ImageScaleType) -> DecodingInfo {
        DecodingInfo {
            cache_key: "test".to_string(),
            target_size: target,
            view_scale_type: ViewScaleType::FitInside,
            scale_type,
            consider_exif: false,
        }
    }

    fn decoder() -> BaseImageDecoder {
        BaseImageDecoder::new(&LoaderConfig::default())
    }

    #[test]
    fn power_of_two_subsamples_during_decode() {
        let stream = SourceStream::from_bytes(create_png_bytes(100, 100));
        let buffer = decoder()
            .decode(stream, &info(ImageSize::new(10, 10), ImageScaleType::PowerOf2))
            .expect("decode png");
        assert_eq!(buffer.size(), ImageSize::new(12, 12));
    }

    #[test]
    fn none_keeps_original_size() {
        let stream = SourceStream::from_bytes(create_png_bytes(40, 30));
        let buffer = decoder()
            .decode(stream, &info(ImageSize::new(10, 10), ImageScaleType::None))
            .expect("decode png");
        assert_eq!(buffer.size(), ImageSize::new(40, 30));
    }

    #[test]
    fn exact_scales_binding_axis_to_target() {
        let stream = SourceStream::from_bytes(create_png_bytes(40, 40));
        let buffer = decoder()
            .decode(stream, &info(ImageSize::new(15, 15), ImageScaleType::Exact))
            .expect("decode png");
        // 整数采样 2 → 20x20，再精确缩放到 15x15
        assert_eq!(buffer.size(), ImageSize::new(15, 15));
    }

    #[test]
    fn exact_stretched_may_upscale() {
        let stream = SourceStream::from_bytes(create_png_bytes(10, 10));
        let buffer = decoder()
            .decode(stream, &info(ImageSize::new(20, 20), ImageScaleType::ExactStretched))
            .expect("decode png");
        assert_eq!(buffer.size(), ImageSize::new(20, 20));

        let stream = SourceStream::from_bytes(create_png_bytes(10, 10));
        let buffer = decoder()
            .decode(stream, &info(ImageSize::new(20, 20), ImageScaleType::Exact))
            .expect("decode png");
        assert_eq!(buffer.size(), ImageSize::new(10, 10));
    }

    #[test]
    fn oversized_header_is_rejected_before_full_decode() {
        let config = LoaderConfig {
            max_decoded_pixels: 100,
            ..LoaderConfig::default()
        };
        let stream = SourceStream::from_bytes(create_png_bytes(20, 20));
        let result = BaseImageDecoder::new(&config)
            .decode(stream, &info(ImageSize::new(10, 10), ImageScaleType::None));
        assert!(matches!(result, Err(ImageError::ResourceLimit(_))));
    }

    #[test]
    fn garbage_bytes_are_invalid_format() {
        let stream = SourceStream::from_bytes(b"definitely not an image".to_vec());
        let result = decoder().decode(stream, &info(ImageSize::new(10, 10), ImageScaleType::PowerOf2));
        assert!(matches!(result, Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn rotation_swaps_axes_for_sampling() {
        let decoder = decoder();
        let info = info(ImageSize::new(10, 40), ImageScaleType::Integer);
        // 未旋转：40x10 适配 10x40 → 采样 4；旋转后源为 10x40 → 采样 1
        let (plain, plain_sample) = decoder.output_size(ImageSize::new(40, 10), false, &info);
        let (rotated, rotated_sample) = decoder.output_size(ImageSize::new(40, 10), true, &info);
        assert_eq!((plain, plain_sample), (ImageSize::new(10, 2), 4));
        assert_eq!((rotated, rotated_sample), (ImageSize::new(40, 10), 1));
    }
}
