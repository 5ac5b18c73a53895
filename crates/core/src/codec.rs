//! Image codec adapter: obtains caller-supplied image bytes, reads their
//! dimensions, writes them to scratch storage and re-encodes backend output.

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, ImageReader};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{WorkerError, WorkerResult};
use crate::logging::redacted_url_for_display;

const SUPPORTED_INPUT_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];
const DEFAULT_URL_EXTENSION: &str = "jpg";
const DEFAULT_INLINE_EXTENSION: &str = "png";

/// Where the caller's image comes from. Constructing one enforces that
/// exactly one source was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(Url),
    Inline(String),
}

impl ImageSource {
    pub fn from_fields(url: Option<&str>, inline: Option<&str>) -> WorkerResult<Self> {
        let url = url.map(str::trim).filter(|value| !value.is_empty());
        let inline = inline.map(str::trim).filter(|value| !value.is_empty());

        match (url, inline) {
            (Some(_), Some(_)) => Err(WorkerError::input(
                "Both image_url and image_base64 were provided. Please provide only one.",
            )),
            (Some(url), None) => parse_http_url(url).map(Self::Url),
            (None, Some(inline)) => Ok(Self::Inline(inline.to_string())),
            (None, None) => Err(WorkerError::input(
                "No input image provided. Please provide image_url or image_base64.",
            )),
        }
    }
}

fn parse_http_url(raw: &str) -> WorkerResult<Url> {
    let parsed = Url::parse(raw).map_err(|err| {
        WorkerError::input(format!(
            "invalid image_url '{}': {err}",
            crate::logging::redact_sensitive_text(raw)
        ))
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(WorkerError::input(format!(
            "unsupported image_url scheme '{scheme}' for '{}' (expected http/https)",
            redacted_url_for_display(&parsed)
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn scaled(self, factor: u32) -> Self {
        Self {
            width: self.width.saturating_mul(factor),
            height: self.height.saturating_mul(factor),
        }
    }

    pub fn exceeds(self, limit: u32) -> bool {
        self.width > limit || self.height > limit
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Retrieves image bytes. Holds one HTTP client so every request shares a
/// connection pool; there is a single attempt per fetch.
pub struct ImageFetcher {
    client: reqwest::blocking::Client,
}

impl ImageFetcher {
    pub fn new(timeout: Option<Duration>) -> WorkerResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                WorkerError::unexpected(format!("failed to build HTTP client for image fetch: {err}"))
            })?;
        Ok(Self { client })
    }

    pub fn fetch(&self, source: &ImageSource) -> WorkerResult<Vec<u8>> {
        match source {
            ImageSource::Inline(data) => {
                debug!(encoded_len = data.len(), "decoding inline image payload");
                decode_inline(data)
            }
            ImageSource::Url(url) => self.fetch_url(url),
        }
    }

    fn fetch_url(&self, url: &Url) -> WorkerResult<Vec<u8>> {
        let redacted = redacted_url_for_display(url);
        info!(url = %redacted, "downloading input image");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|err| {
                WorkerError::Fetch(format!(
                    "failed to fetch image from {redacted}: {}",
                    crate::logging::redact_sensitive_text(&err.to_string())
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Fetch(format!(
                "image request returned HTTP {} for {redacted}",
                status.as_u16()
            )));
        }

        let bytes = response.bytes().map_err(|err| {
            WorkerError::Fetch(format!(
                "failed while reading image body from {redacted}: {}",
                crate::logging::redact_sensitive_text(&err.to_string())
            ))
        })?;
        debug!(url = %redacted, bytes = bytes.len(), "input image downloaded");
        Ok(bytes.to_vec())
    }
}

/// Decodes standard base64, dropping a `data:<mime>;base64,` prefix and any
/// line wrapping first.
pub fn decode_inline(data: &str) -> WorkerResult<Vec<u8>> {
    let payload = strip_media_type_prefix(data);
    let compact: String = payload
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();

    BASE64
        .decode(compact.as_bytes())
        .map_err(|err| WorkerError::Decode(format!("image_base64 is not valid base64: {err}")))
}

fn strip_media_type_prefix(data: &str) -> &str {
    let trimmed = data.trim();
    match trimmed.split_once(',') {
        Some((prefix, payload)) if prefix.starts_with("data:") || prefix.ends_with(";base64") => {
            payload
        }
        _ => trimmed,
    }
}

pub fn encode_to_inline(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn encode_file_to_inline(path: &Path) -> WorkerResult<String> {
    debug!(path = %path.display(), "encoding backend output");
    let bytes = fs::read(path).map_err(|err| {
        WorkerError::unexpected(format!(
            "failed to read backend output {}: {err}",
            path.display()
        ))
    })?;
    Ok(encode_to_inline(&bytes))
}

pub fn decode_dimensions(bytes: &[u8]) -> WorkerResult<Dimensions> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| WorkerError::Decode(format!("failed to inspect image bytes: {err}")))?;

    if reader.format().is_none() {
        return Err(WorkerError::Decode(
            "input is not a supported image format".to_string(),
        ));
    }

    let (width, height) = reader
        .into_dimensions()
        .map_err(|err| WorkerError::Decode(format!("failed to read image dimensions: {err}")))?;
    Ok(Dimensions::new(width, height))
}

/// Picks the scratch-file extension for an input image. URL inputs trust the
/// URL suffix; inline inputs must decode as an image.
pub fn input_extension(source: &ImageSource, bytes: &[u8]) -> WorkerResult<&'static str> {
    match source {
        ImageSource::Url(url) => Ok(extension_from_url(url)),
        ImageSource::Inline(_) => {
            let format = image::guess_format(bytes).map_err(|err| {
                WorkerError::Decode(format!("image_base64 does not contain an image: {err}"))
            })?;
            Ok(extension_for_format(format).unwrap_or_else(|| {
                warn!(
                    format = ?format,
                    fallback = DEFAULT_INLINE_EXTENSION,
                    "inline image format has no supported extension; using fallback"
                );
                DEFAULT_INLINE_EXTENSION
            }))
        }
    }
}

fn extension_from_url(url: &Url) -> &'static str {
    let suffix = Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match SUPPORTED_INPUT_EXTENSIONS
        .iter()
        .find(|candidate| **candidate == suffix)
        .copied()
    {
        Some(ext) => ext,
        None => {
            warn!(
                extension = %suffix,
                fallback = DEFAULT_URL_EXTENSION,
                "unsupported file extension on image_url; using fallback"
            );
            DEFAULT_URL_EXTENSION
        }
    }
}

fn extension_for_format(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("png"),
        ImageFormat::Jpeg => Some("jpg"),
        ImageFormat::WebP => Some("webp"),
        _ => None,
    }
}

pub fn materialize_to_storage(bytes: &[u8], path: &Path) -> WorkerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            WorkerError::unexpected(format!(
                "failed to create scratch directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    fs::write(path, bytes).map_err(|err| {
        WorkerError::unexpected(format!(
            "failed to write input image {}: {err}",
            path.display()
        ))
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "input image written");
    Ok(())
}
