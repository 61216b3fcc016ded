use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::error::{PoolError, Result};
use crate::rembg::progress::{ProgressEvent, ProgressReporter, ProgressStatus};

/// Locally resolvable image locator.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// `data:image/png;base64,...`
    DataUri(String),
    /// `http://` or `https://`
    Remote(Url),
    /// Filesystem path, or a `file://` URL.
    Path(PathBuf),
    /// Bytes already in memory (e.g. an upload).
    Bytes(Bytes),
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataUri(uri) => write!(f, "DataUri({} bytes)", uri.len()),
            Self::Remote(url) => write!(f, "Remote({})", url),
            Self::Path(path) => write!(f, "Path({})", path.display()),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

impl FromStr for ImageSource {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PoolError::new("empty_image_source"));
        }
        if s.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("data:")) {
            return Ok(Self::DataUri(s.to_string()));
        }

        match Url::parse(s) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::Path)
                    .map_err(|_| PoolError::new("invalid_file_url").push_str(s.to_string())),
                // Windows drive letters parse as a one-letter scheme.
                scheme if scheme.len() == 1 => Ok(Self::Path(PathBuf::from(s))),
                scheme => Err(PoolError::new("unsupported_scheme").push_str(scheme.to_string())),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::Path(PathBuf::from(s))),
            Err(e) => Err(e.into()),
        }
    }
}

impl From<Bytes> for ImageSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Url> for ImageSource {
    fn from(url: Url) -> Self {
        Self::Remote(url)
    }
}

impl ImageSource {
    /// Short label for logs and progress events.
    pub fn label(&self) -> String {
        match self {
            Self::DataUri(_) => "data-uri".to_string(),
            Self::Remote(url) => url.to_string(),
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(_) => "memory".to_string(),
        }
    }

    /// Resolve the locator to raw encoded image bytes.
    pub async fn load(&self, client: &Client, progress: &ProgressReporter) -> Result<Bytes> {
        progress.report(ProgressEvent::new(ProgressStatus::Fetching).with_file(self.label()));

        match self {
            Self::DataUri(uri) => decode_data_uri(uri),
            Self::Remote(url) => download(client, url, progress).await,
            Self::Path(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            Self::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

fn decode_data_uri(uri: &str) -> Result<Bytes> {
    let (header, payload) = uri
        .split_once(',')
        .ok_or_else(|| PoolError::new("malformed_data_uri").push_str("missing ',' separator"))?;

    if !header.to_ascii_lowercase().ends_with(";base64") {
        return Err(PoolError::new("unsupported_data_uri").push_str("only base64 payloads are accepted"));
    }

    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(Bytes::from(STANDARD.decode(cleaned)?))
}

async fn download(client: &Client, url: &Url, progress: &ProgressReporter) -> Result<Bytes> {
    let mut response = client.get(url.clone()).send().await?.error_for_status()?;
    let total = response.content_length();
    let file = url.to_string();

    let mut buf = BytesMut::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        progress.report(ProgressEvent::download(file.clone(), buf.len() as u64, total));
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_kind() {
        assert!(matches!(
            "data:image/png;base64,AAAA".parse::<ImageSource>().unwrap(),
            ImageSource::DataUri(_)
        ));
        assert!(matches!(
            "https://example.com/cat.png".parse::<ImageSource>().unwrap(),
            ImageSource::Remote(_)
        ));
        assert_eq!(
            "images/cat.png".parse::<ImageSource>().unwrap(),
            ImageSource::Path(PathBuf::from("images/cat.png"))
        );
        assert!(matches!(
            "ftp://example.com/cat.png".parse::<ImageSource>(),
            Err(e) if e.key == "unsupported_scheme"
        ));
        assert!("   ".parse::<ImageSource>().is_err());
    }

    #[test]
    fn decodes_base64_data_uri() {
        let bytes = decode_data_uri("data:text/plain;base64,aGVs\nbG8=").unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[test]
    fn rejects_non_base64_data_uri() {
        let err = decode_data_uri("data:text/plain,hello").unwrap_err();
        assert_eq!(err.key, "unsupported_data_uri");
        assert!(decode_data_uri("data:image/png;base64").is_err());
    }

    #[tokio::test]
    async fn loads_in_memory_bytes() {
        let source = ImageSource::from(vec![1u8, 2, 3]);
        let bytes = source.load(&Client::new(), &ProgressReporter::noop()).await.unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let source = ImageSource::Path(PathBuf::from("/definitely/not/here.png"));
        let err = source.load(&Client::new(), &ProgressReporter::noop()).await.unwrap_err();
        assert_eq!(err.key, "io_error");
    }
}
