//! # 数据源提供者
//!
//! ## 设计思路
//!
//! 按资源标识的协议打开原始字节流，并在“尽可能早”的阶段执行输入校验，
//! 尽快失败，减少不必要的内存与 CPU 消耗。核心流程只看到 `StreamProvider::open`。
//!
//! ## 实现思路
//!
//! - `http(s)`：协议 + 主机安全 + 状态码 + 内容类型 + 体积校验；手动跟随重定向；
//!   可重试错误按指数退避 + 抖动重试；响应体按块读取，首包与分块各有超时。
//! - `data:`：Base64 解析 + 解码前体积估算。
//! - `file://` 与绝对路径：metadata 体积限制 + 打开文件。
//! - `assets://`：相对配置的资源根目录，拒绝越出根目录的路径。
//!
//! 网络模式由三个提供者表达：
//! - `BaseStreamProvider`：正常模式，网络流边下边读
//! - `NetworkDeniedStreamProvider`：网络被禁，`http(s)` 直接失败
//! - `SlowNetworkStreamProvider`：弱网，网络资源经内层提供者整包读取完再解码；默认内层放宽超时、不重试
//!
//! 工作线程是同步阻塞模型，网络请求借助提供者私有的 tokio 运行时 `block_on` 完成。

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::runtime::{Handle, Runtime};

use super::config::LoaderConfig;
use super::source::{Scheme, SourceStream};
use super::ImageError;

const STREAM_SIGNATURE_PROBE_BYTES: usize = 4096;
const NETWORK_RETRY_BASE_DELAY_MS: u64 = 180;
const USER_AGENT: &str = concat!("image-loader/", env!("CARGO_PKG_VERSION"));
const ACCEPT_IMAGES: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

/// 按资源标识打开字节流。
pub trait StreamProvider: Send + Sync {
    /// `extra` 为请求选项里透传的附加信息，内置提供者不使用。
    fn open(&self, uri: &str, extra: Option<&str>) -> Result<SourceStream, ImageError>;
}

/// 网络读取参数。
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub max_file_size: u64,
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub chunk_timeout: Duration,
    pub max_redirects: usize,
    pub allow_private_network: bool,
    /// 单个 URL 的最大尝试次数（含首次）。
    pub max_attempts: u8,
}

impl NetworkSettings {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            download_timeout: Duration::from_secs(config.download_timeout),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            first_byte_timeout: Duration::from_millis(config.stream_first_byte_timeout_ms),
            chunk_timeout: Duration::from_millis(config.stream_chunk_timeout_ms),
            max_redirects: config.max_redirects,
            allow_private_network: config.allow_private_network,
            max_attempts: 3,
        }
    }

    /// 弱网参数：所有超时放宽到三倍，不做重试。
    pub fn relaxed(&self) -> Self {
        Self {
            download_timeout: self.download_timeout * 3,
            connect_timeout: self.connect_timeout * 3,
            first_byte_timeout: self.first_byte_timeout * 3,
            chunk_timeout: self.chunk_timeout * 3,
            max_attempts: 1,
            ..self.clone()
        }
    }
}

/// 正常模式的数据源提供者。
pub struct BaseStreamProvider {
    settings: NetworkSettings,
    assets_dir: Option<PathBuf>,
    runtime: OnceCell<Runtime>,
    client: OnceCell<reqwest::Client>,
}

impl BaseStreamProvider {
    pub fn new(config: &LoaderConfig) -> Self {
        Self::with_settings(NetworkSettings::from_config(config), config.assets_dir.clone())
    }

    pub fn with_settings(settings: NetworkSettings, assets_dir: Option<PathBuf>) -> Self {
        Self {
            settings,
            assets_dir,
            runtime: OnceCell::new(),
            client: OnceCell::new(),
        }
    }

    fn handle(&self) -> Result<Handle, ImageError> {
        let runtime = self.runtime.get_or_try_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("image-loader-net")
                .enable_all()
                .build()
                .map_err(|e| ImageError::Network(format!("无法创建网络运行时：{}", e)))
        })?;
        Ok(runtime.handle().clone())
    }

    fn client(&self) -> Result<&reqwest::Client, ImageError> {
        self.client.get_or_try_init(|| {
            reqwest::Client::builder()
                .timeout(self.settings.download_timeout)
                .connect_timeout(self.settings.connect_timeout)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| ImageError::Network(format!("无法创建 HTTP 客户端：{}", e)))
        })
    }

    fn open_network(&self, url: &str) -> Result<SourceStream, ImageError> {
        log::debug!("🌐 开始下载图片 - URL: {}", redact_url_for_log(url));

        let handle = self.handle()?;
        let client = self.client()?;
        let response = handle.block_on(fetch_response(client, url, &self.settings))?;
        let content_length = response.content_length();

        let reader = HttpBodyReader {
            handle,
            response,
            pending: Bytes::new(),
            received: 0,
            max_file_size: self.settings.max_file_size,
            first_byte_timeout: self.settings.first_byte_timeout,
            chunk_timeout: self.settings.chunk_timeout,
            probe: Vec::new(),
            signature_validated: false,
        };

        Ok(SourceStream::new(Box::new(reader), content_length))
    }

    fn open_file(&self, path: &Path) -> Result<SourceStream, ImageError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            ImageError::FileSystem(format!("无法读取文件信息 '{}'：{}", path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(ImageError::FileSystem(format!("不是文件：{}", path.display())));
        }

        if metadata.len() > self.settings.max_file_size {
            return Err(ImageError::ResourceLimit(format!(
                "文件过大：{:.2} MB（限制：{:.2} MB）",
                metadata.len() as f64 / 1024.0 / 1024.0,
                self.settings.max_file_size as f64 / 1024.0 / 1024.0
            )));
        }

        let file = File::open(path)
            .map_err(|e| ImageError::FileSystem(format!("无法打开图片文件：{}", e)))?;
        Ok(SourceStream::new(Box::new(BufReader::new(file)), Some(metadata.len())))
    }

    fn open_data(&self, uri: &str) -> Result<SourceStream, ImageError> {
        let bytes = parse_data_url_with_limit(uri, self.settings.max_file_size)?;
        validate_image_signature(&bytes)?;
        Ok(SourceStream::from_bytes(bytes))
    }

    fn open_asset(&self, relative: &str) -> Result<SourceStream, ImageError> {
        let root = self
            .assets_dir
            .as_ref()
            .ok_or_else(|| ImageError::FileSystem("未配置资源目录（assets_dir）".to_string()))?;

        let relative = Path::new(relative.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(ImageError::InvalidFormat(format!(
                "资源路径不合法：{}",
                relative.display()
            )));
        }

        self.open_file(&root.join(relative))
    }
}

impl StreamProvider for BaseStreamProvider {
    fn open(&self, uri: &str, extra: Option<&str>) -> Result<SourceStream, ImageError> {
        if let Some(extra) = extra {
            log::trace!("附加信息（未使用）：{}", extra);
        }

        match Scheme::of_uri(uri) {
            Scheme::Http | Scheme::Https => self.open_network(uri.trim()),
            Scheme::File => self.open_file(Path::new(Scheme::File.crop(uri))),
            Scheme::Data => self.open_data(uri),
            Scheme::Assets => self.open_asset(Scheme::Assets.crop(uri)),
            Scheme::Unknown => Err(ImageError::InvalidFormat(format!(
                "不支持的资源标识：{}",
                redact_url_for_log(uri)
            ))),
        }
    }
}

impl Drop for BaseStreamProvider {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// 网络被禁模式：`http(s)` 直接失败，其余协议照常。
pub struct NetworkDeniedStreamProvider {
    inner: Arc<dyn StreamProvider>,
}

impl NetworkDeniedStreamProvider {
    pub fn new(inner: Arc<dyn StreamProvider>) -> Self {
        Self { inner }
    }
}

impl StreamProvider for NetworkDeniedStreamProvider {
    fn open(&self, uri: &str, extra: Option<&str>) -> Result<SourceStream, ImageError> {
        if Scheme::of_uri(uri).is_network() {
            return Err(ImageError::NetworkDenied(redact_url_for_log(uri)));
        }
        self.inner.open(uri, extra)
    }
}

/// 弱网模式：网络资源整包读取后再交给解码，其余协议照常。
///
/// 网络资源同样走 `inner`，自定义传输（鉴权、代理）在弱网下保持不变。
pub struct SlowNetworkStreamProvider {
    inner: Arc<dyn StreamProvider>,
    max_file_size: u64,
}

impl SlowNetworkStreamProvider {
    pub fn new(inner: Arc<dyn StreamProvider>, max_file_size: u64) -> Self {
        Self {
            inner,
            max_file_size,
        }
    }

    /// 未注入自定义提供者时的默认弱网传输：超时放宽、不重试。
    pub fn with_relaxed_network(config: &LoaderConfig) -> Self {
        let settings = NetworkSettings::from_config(config).relaxed();
        let inner = BaseStreamProvider::with_settings(settings, config.assets_dir.clone());
        Self::new(Arc::new(inner), config.max_file_size)
    }
}

impl StreamProvider for SlowNetworkStreamProvider {
    fn open(&self, uri: &str, extra: Option<&str>) -> Result<SourceStream, ImageError> {
        let stream = self.inner.open(uri, extra)?;
        if !Scheme::of_uri(uri).is_network() {
            return Ok(stream);
        }

        let bytes = stream.read_all_with_limit(self.max_file_size)?;
        log::debug!("✅ 弱网整包下载完成 - {} bytes", bytes.len());
        Ok(SourceStream::from_bytes(bytes))
    }
}

/// 网络响应体读取器：每次 `read` 最多拉取一个分块。
struct HttpBodyReader {
    handle: Handle,
    response: reqwest::Response,
    pending: Bytes,
    received: u64,
    max_file_size: u64,
    first_byte_timeout: Duration,
    chunk_timeout: Duration,
    probe: Vec<u8>,
    signature_validated: bool,
}

impl HttpBodyReader {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, ImageError> {
        let read_timeout = if self.received > 0 {
            self.chunk_timeout
        } else {
            self.first_byte_timeout
        };

        let first = self.received == 0;
        let response = &mut self.response;
        let chunk = self
            .handle
            .block_on(async move { tokio::time::timeout(read_timeout, response.chunk()).await })
            .map_err(|_| {
                if first {
                    ImageError::Timeout("下载首包超时".to_string())
                } else {
                    ImageError::Timeout("下载数据流读取超时".to_string())
                }
            })?
            .map_err(|e| ImageError::Network(format!("下载失败：{}", e)))?;

        let Some(chunk) = chunk else {
            if !self.signature_validated {
                validate_image_signature(&self.probe)?;
                self.signature_validated = true;
            }
            return Ok(None);
        };

        self.received = self.received.saturating_add(chunk.len() as u64);
        if self.received > self.max_file_size {
            return Err(ImageError::ResourceLimit("下载后文件超过大小限制".to_string()));
        }

        if !self.signature_validated {
            let take = STREAM_SIGNATURE_PROBE_BYTES
                .saturating_sub(self.probe.len())
                .min(chunk.len());
            self.probe.extend_from_slice(&chunk[..take]);
            self.signature_validated =
                validate_stream_signature_probe(&self.probe, STREAM_SIGNATURE_PROBE_BYTES)?;
        }

        Ok(Some(chunk))
    }
}

impl Read for HttpBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.pending.is_empty() {
            match self.next_chunk().map_err(ImageError::into_io)? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }

        let count = buf.len().min(self.pending.len());
        let head = self.pending.split_to(count);
        buf[..count].copy_from_slice(&head);
        Ok(count)
    }
}

/// 发起请求并处理重试、重定向、状态码与响应头校验，返回可读取响应体的响应。
async fn fetch_response(
    client: &reqwest::Client,
    url: &str,
    settings: &NetworkSettings,
) -> Result<reqwest::Response, ImageError> {
    validate_url_safety(url, settings)?;
    let mut current_url = reqwest::Url::parse(url)
        .map_err(|e| ImageError::InvalidFormat(format!("URL 格式错误：{}", e)))?;

    for redirect_count in 0..=settings.max_redirects {
        let response = send_with_retry(client, &current_url, settings).await?;

        if response.status().is_redirection() {
            if redirect_count >= settings.max_redirects {
                return Err(ImageError::Network(format!(
                    "重定向次数超过限制（{}）",
                    settings.max_redirects
                )));
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .ok_or_else(|| ImageError::Network("重定向响应缺少 Location 头".to_string()))?
                .to_str()
                .map_err(|e| ImageError::InvalidFormat(format!("重定向地址无效：{}", e)))?;

            let next_url = current_url
                .join(location)
                .map_err(|e| ImageError::InvalidFormat(format!("重定向 URL 解析失败：{}", e)))?;
            validate_url_safety(next_url.as_str(), settings)?;

            log::debug!("↪️ 跳转到: {}", redact_url_for_log(next_url.as_str()));
            current_url = next_url;
            continue;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Network(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status_message(status.as_u16())
            )));
        }

        if let Some(content_type) = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            if !is_image_content_type(content_type) {
                return Err(ImageError::InvalidFormat(format!("不是图片类型：{}", content_type)));
            }
        }

        if let Some(length) = response.content_length() {
            if length > settings.max_file_size {
                return Err(ImageError::ResourceLimit(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    length as f64 / 1024.0 / 1024.0,
                    settings.max_file_size as f64 / 1024.0 / 1024.0
                )));
            }
        }

        return Ok(response);
    }

    Err(ImageError::Network("下载流程异常结束".to_string()))
}

async fn send_with_retry(
    client: &reqwest::Client,
    url: &reqwest::Url,
    settings: &NetworkSettings,
) -> Result<reqwest::Response, ImageError> {
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt: u8 = 1;

    loop {
        let result = client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, ACCEPT_IMAGES)
            .send()
            .await;

        match result {
            Ok(response) => {
                if attempt < max_attempts && is_retryable_http_status(response.status()) {
                    let delay_ms = retry_delay_with_jitter(attempt, retry_after_hint_ms(response.headers()));
                    log::warn!(
                        "⚠️ HTTP {}（第 {}/{} 次，可重试）；{}ms 后重试",
                        response.status().as_u16(),
                        attempt,
                        max_attempts,
                        delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if attempt >= max_attempts || !is_retryable_network_error(&err) {
                    return Err(map_reqwest_error(err, url.as_str(), settings));
                }

                let delay_ms = retry_delay_with_jitter(attempt, None);
                log::warn!(
                    "⚠️ 网络请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试",
                    attempt,
                    max_attempts,
                    redact_error_message(&err.to_string(), url.as_str()),
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

fn map_reqwest_error(error: reqwest::Error, url: &str, settings: &NetworkSettings) -> ImageError {
    let message = redact_error_message(&error.to_string(), url);
    if error.is_timeout() {
        ImageError::Timeout(format!("下载超时（{}秒）", settings.download_timeout.as_secs()))
    } else if error.is_connect() {
        ImageError::Network(format!("无法连接：{}", message))
    } else {
        ImageError::Network(format!("请求失败：{}", message))
    }
}

fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    if error.is_timeout() || error.is_connect() {
        return true;
    }

    let message = error.to_string().to_lowercase();
    ["connection reset", "connection closed before message completed", "unexpected eof"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn is_retryable_http_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn retry_after_hint_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let seconds = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(seconds.saturating_mul(1000))
}

/// 指数退避（或服务端提示）+ 最多一半的随机抖动。
fn retry_delay_with_jitter(attempt: u8, server_hint_ms: Option<u64>) -> u64 {
    let exponential =
        NETWORK_RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << attempt.saturating_sub(1).min(16));
    let base = server_hint_ms.unwrap_or(exponential);
    let jitter_bound = (base / 2).max(1);
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() as u64)
        .unwrap_or(0);
    base.saturating_add(seed % (jitter_bound + 1))
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|base| base.trim().to_ascii_lowercase().starts_with("image/"))
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}

/// 去掉 query 与 fragment，避免日志泄露签名参数。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    if Scheme::of_uri(url) == Scheme::Data {
        return "data:<inline>".to_string();
    }

    let Ok(parsed) = reqwest::Url::parse(url) else {
        return url.split(['?', '#']).next().unwrap_or_default().to_string();
    };

    let host = parsed.host_str().unwrap_or_default();
    let port = parsed.port().map(|port| format!(":{}", port)).unwrap_or_default();
    format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
}

fn redact_error_message(message: &str, url: &str) -> String {
    message.replace(url, &redact_url_for_log(url))
}

/// 校验 URL 安全性；未允许时拒绝本地与内网目标。
fn validate_url_safety(url: &str, settings: &NetworkSettings) -> Result<(), ImageError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ImageError::InvalidFormat(format!("URL 格式错误：{}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ImageError::InvalidFormat("仅支持 HTTP/HTTPS".to_string()));
    }

    if settings.allow_private_network {
        return Ok(());
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ImageError::InvalidFormat("URL 缺少主机地址".to_string()))?;

    if is_local_hostname(host) {
        return Err(ImageError::InvalidFormat(format!("禁止访问本地网络地址：{}", host)));
    }

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_or_local_ip(ip) {
            return Err(ImageError::InvalidFormat(format!("禁止访问内网 IP：{}", ip)));
        }
    }

    Ok(())
}

fn is_local_hostname(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case("localhost.")
        || host.to_ascii_lowercase().ends_with(".local")
}

fn is_private_or_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_multicast()
                || octets[0] == 0
                || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
        }
    }
}

/// 解析 `data:image/...;base64,` 形式的资源标识。
fn parse_data_url_with_limit(uri: &str, max_file_size: u64) -> Result<Vec<u8>, ImageError> {
    let normalized = uri.trim();
    let (header, payload) = normalized
        .split_once(',')
        .ok_or_else(|| ImageError::InvalidFormat("Data URL 缺少数据段".to_string()))?;

    let header = header.to_ascii_lowercase();
    if !header.starts_with("data:image/") {
        return Err(ImageError::InvalidFormat("Data URL 不是图片类型".to_string()));
    }
    if !header.ends_with(";base64") {
        return Err(ImageError::InvalidFormat("缺少 base64 标记".to_string()));
    }

    let payload = payload.trim();
    let estimated = (payload.len() as u64).div_ceil(4).saturating_mul(3);
    if estimated > max_file_size {
        return Err(ImageError::ResourceLimit(format!(
            "Base64 预计解码体积过大：{:.2} MB（限制：{:.2} MB）",
            estimated as f64 / 1024.0 / 1024.0,
            max_file_size as f64 / 1024.0 / 1024.0
        )));
    }

    general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| ImageError::InvalidFormat(format!("Base64 解码失败：{}", e)))
}

/// 通过文件签名（magic bytes）校验输入是否为图片。
fn validate_image_signature(bytes: &[u8]) -> Result<(), ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::InvalidFormat("图片内容为空".to_string()));
    }

    let kind = infer::get(bytes)
        .ok_or_else(|| ImageError::InvalidFormat("无法识别图片类型".to_string()))?;

    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(ImageError::InvalidFormat(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }

    Ok(())
}

/// 下载过程中的签名探测。
///
/// - `Ok(true)`：已识别为图片
/// - `Ok(false)`：字节不足以判断，继续读取
/// - `Err(...)`：已识别为非图片，或达到探测上限仍无法识别
fn validate_stream_signature_probe(bytes: &[u8], probe_limit: usize) -> Result<bool, ImageError> {
    if bytes.is_empty() {
        return Ok(false);
    }

    if let Some(kind) = infer::get(bytes) {
        if kind.matcher_type() != infer::MatcherType::Image {
            return Err(ImageError::InvalidFormat(format!(
                "下载内容不是图片类型：{}",
                kind.mime_type()
            )));
        }
        return Ok(true);
    }

    if bytes.len() >= probe_limit {
        return Err(ImageError::InvalidFormat(format!(
            "下载前 {} 字节内无法识别图片类型",
            probe_limit
        )));
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn png_bytes() -> Vec<u8> {
        let image = image::RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    /// 单次响应的本地 HTTP 桩服务，返回监听地址。
    fn serve_once(response_head: String, body: Vec<u8>) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server failed");
        let addr = listener.local_addr().expect("read local addr failed");
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept failed");
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request);
            stream.write_all(response_head.as_bytes()).expect("write headers failed");
            stream.write_all(&body).expect("write body failed");
            stream.flush().expect("flush failed");
        });
        (format!("http://127.0.0.1:{}", addr.port()), server)
    }

    fn provider() -> BaseStreamProvider {
        BaseStreamProvider::new(&LoaderConfig::default())
    }

    #[test]
    fn http_stream_yields_image_bytes() {
        let body = png_bytes();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let (base, server) = serve_once(head, body.clone());

        let stream = provider()
            .open(&format!("{}/a.png?token=secret", base), None)
            .expect("open http stream");
        assert_eq!(stream.content_length(), Some(body.len() as u64));
        let bytes = stream.read_all_with_limit(1024 * 1024).expect("read body");
        server.join().expect("server thread failed");

        assert_eq!(bytes, body);
    }

    #[test]
    fn http_stream_rejects_non_image_body_even_with_image_content_type() {
        let body = b"hello world".to_vec();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let (base, server) = serve_once(head, body);

        let stream = provider().open(&format!("{}/fake.png", base), None).expect("open http stream");
        let result = stream.read_all_with_limit(1024);
        server.join().expect("server thread failed");

        assert!(matches!(result, Err(ImageError::InvalidFormat(_))));
    }

    #[test]
    fn http_error_status_is_network_error() {
        let head = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
        let (base, server) = serve_once(head, Vec::new());

        let result = provider().open(&format!("{}/missing.png", base), None);
        server.join().expect("server thread failed");

        assert!(matches!(result, Err(ImageError::Network(_))));
    }

    #[test]
    fn private_targets_blocked_when_not_allowed() {
        let config = LoaderConfig {
            allow_private_network: false,
            ..LoaderConfig::default()
        };
        let provider = BaseStreamProvider::new(&config);

        assert!(matches!(
            provider.open("http://127.0.0.1:9/image.png", None),
            Err(ImageError::InvalidFormat(_))
        ));
        assert!(matches!(
            provider.open("https://localhost/image.png", None),
            Err(ImageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn slow_network_provider_buffers_whole_body() {
        let body = png_bytes();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let (base, server) = serve_once(head, body.clone());

        let slow = SlowNetworkStreamProvider::with_relaxed_network(&LoaderConfig::default());
        let stream = slow.open(&format!("{}/a.png", base), None).expect("open stream");
        // 数据已整包下载，服务端可以先结束
        server.join().expect("server thread failed");

        assert_eq!(stream.read_all_with_limit(1024 * 1024).expect("read body"), body);
    }

    /// 把所有资源标识映射到同一份 PNG 的内存提供者，记录调用次数。
    struct CountingProvider {
        opens: std::sync::atomic::AtomicUsize,
    }

    impl StreamProvider for CountingProvider {
        fn open(&self, _uri: &str, _extra: Option<&str>) -> Result<SourceStream, ImageError> {
            self.opens.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let bytes = png_bytes();
            Ok(SourceStream::new(Box::new(io::Cursor::new(bytes)), None))
        }
    }

    #[test]
    fn slow_network_provider_keeps_injected_transport() {
        let inner = Arc::new(CountingProvider {
            opens: std::sync::atomic::AtomicUsize::new(0),
        });
        let slow = SlowNetworkStreamProvider::new(inner.clone(), 1024 * 1024);

        let stream = slow.open("http://fixtures.test/slow.png", None).expect("open stream");
        assert_eq!(stream.content_length(), Some(png_bytes().len() as u64));
        assert_eq!(stream.read_all_with_limit(1024 * 1024).expect("read"), png_bytes());
        assert_eq!(inner.opens.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn denied_provider_refuses_network_but_reads_files() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("a.png");
        std::fs::write(&path, png_bytes()).expect("write png");

        let denied = NetworkDeniedStreamProvider::new(Arc::new(provider()));
        assert!(matches!(
            denied.open("https://example.com/a.png", None),
            Err(ImageError::NetworkDenied(_))
        ));

        let uri = Scheme::File.wrap(&path.to_string_lossy());
        assert!(denied.open(&uri, None).is_ok());
    }

    #[test]
    fn data_url_is_decoded_and_checked() {
        let encoded = general_purpose::STANDARD.encode(png_bytes());
        let uri = format!("data:image/png;base64,{}", encoded);
        let stream = provider().open(&uri, None).expect("open data url");
        assert_eq!(stream.read_all_with_limit(1024 * 1024).expect("read"), png_bytes());

        assert!(matches!(
            provider().open("data:image/png;base64,SGVsbG8=", None),
            Err(ImageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn oversized_data_url_rejected_before_decode() {
        let huge = format!("data:image/png;base64,{}", "A".repeat(1024 * 1024));
        assert!(matches!(
            parse_data_url_with_limit(&huge, 32),
            Err(ImageError::ResourceLimit(_))
        ));
    }

    #[test]
    fn assets_resolve_under_root_only() {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("icons")).expect("create icons dir");
        std::fs::write(dir.path().join("icons/a.png"), png_bytes()).expect("write asset");

        let config = LoaderConfig {
            assets_dir: Some(dir.path().to_path_buf()),
            ..LoaderConfig::default()
        };
        let provider = BaseStreamProvider::new(&config);

        assert!(provider.open("assets://icons/a.png", None).is_ok());
        assert!(matches!(
            provider.open("assets://../secret.png", None),
            Err(ImageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn unknown_scheme_is_invalid_format() {
        assert!(matches!(
            provider().open("ftp://example.com/a.png", None),
            Err(ImageError::InvalidFormat(_))
        ));
    }

    #[test]
    fn helpers_behave_as_expected() {
        assert!(is_image_content_type("image/png; charset=utf-8"));
        assert!(!is_image_content_type("text/html"));
        assert!(is_retryable_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_http_status(reqwest::StatusCode::BAD_REQUEST));
        assert_eq!(
            redact_url_for_log("https://example.com:8443/img.png?token=abc#x"),
            "https://example.com:8443/img.png"
        );
        assert!(matches!(
            validate_stream_signature_probe(b"<html></html>", 64),
            Err(ImageError::InvalidFormat(_))
        ));
    }
}
