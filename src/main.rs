//! # 图片加载库：命令行演示
//!
//! 用法：`image-loader <uri> [width height] [out.png]`
//!
//! 通过完整链路同步加载一张图片，可选把解码结果写成 PNG。
//! 设置 `IMAGE_LOADER_CONFIG=<path.json>` 可加载自定义配置。

use std::path::PathBuf;
use std::process::ExitCode;

use image_loader::{ImageLoader, ImageSize, LoadOptions, LoaderConfig, LoaderError};

const USAGE: &str = "用法: image-loader <uri> [width height] [out.png]";

struct Args {
    uri: String,
    target_size: Option<ImageSize>,
    output: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let uri = args.next().ok_or_else(|| USAGE.to_string())?;
    let rest: Vec<String> = args.collect();

    let (target_size, output) = match rest.as_slice() {
        [] => (None, None),
        [output] => (None, Some(PathBuf::from(output))),
        [width, height, tail @ ..] => {
            let width = width.parse::<u32>().map_err(|e| format!("宽度无效 '{}': {}", width, e))?;
            let height = height.parse::<u32>().map_err(|e| format!("高度无效 '{}': {}", height, e))?;
            let output = match tail {
                [] => None,
                [output] => Some(PathBuf::from(output)),
                _ => return Err(USAGE.to_string()),
            };
            (Some(ImageSize::new(width, height)), output)
        }
    };

    Ok(Args {
        uri,
        target_size,
        output,
    })
}

fn load_config() -> Result<LoaderConfig, LoaderError> {
    match std::env::var_os("IMAGE_LOADER_CONFIG") {
        Some(path) => LoaderConfig::from_json_file(PathBuf::from(path)),
        None => Ok(LoaderConfig::default()),
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let loader = ImageLoader::new(load_config()?)?;
    let options = LoadOptions {
        consider_exif: true,
        ..LoadOptions::cached()
    };

    let buffer = loader.load_image_sync(&args.uri, args.target_size, Some(&options))?;
    log::info!("✅ 加载完成: {}x{} ({} 字节)", buffer.width(), buffer.height(), buffer.byte_size());

    if let Some(output) = args.output {
        let image = buffer
            .to_image()
            .ok_or_else(|| LoaderError::Storage("解码缓冲已回收".to_string()))?;
        image.save(&output)?;
        log::info!("💾 已写入 {}", output.display());
    }

    loader.destroy();
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("❌ 加载失败: {err}");
            ExitCode::FAILURE
        }
    }
}
