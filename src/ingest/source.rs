//! Source descriptors (`type:address`).
//!
//! A descriptor names where a stream's frames come from. The type tag decides how
//! the address is interpreted:
//! - `usb:<index>` : local capture device by index
//! - `file:<path>` : local video file, which must exist
//! - `rtsp:`/`http:`/`https:` (or another approved tag) : network URL, kept whole
//! - `stub:<label>[?width=..&height=..&fps=..]` : synthetic frames, no I/O

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

/// Type tags accepted for network sources unless the caller approves others.
pub const DEFAULT_NETWORK_TAGS: &[&str] = &["rtsp", "http", "https"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceParseError {
    #[error("source {0:?} is missing a `type:` prefix")]
    MissingType(String),
    #[error("usb source address {0:?} is not a device index")]
    BadUsbIndex(String),
    #[error("{0} is defined as file but it does not exist")]
    MissingFile(PathBuf),
    #[error("source type {0:?} is not supported")]
    UnsupportedType(String),
    #[error("invalid {scheme} url {url:?}: {reason}")]
    InvalidUrl {
        scheme: String,
        url: String,
        reason: String,
    },
    #[error("invalid stub source parameter {0:?}")]
    BadSyntheticParam(String),
}

/// Parameters of a synthetic (`stub:`) source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 10.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceDescriptor {
    Usb { index: u32 },
    File { path: PathBuf },
    Network { scheme: String, url: String },
    Synthetic { label: String, params: SyntheticParams },
}

impl SourceDescriptor {
    /// Parse `type:address`, approving only the default network tags.
    pub fn parse(value: &str) -> Result<Self, SourceParseError> {
        Self::parse_with(value, DEFAULT_NETWORK_TAGS)
    }

    /// Parse `type:address`, treating any tag in `network_tags` as a network URL.
    pub fn parse_with(value: &str, network_tags: &[&str]) -> Result<Self, SourceParseError> {
        let value = value.trim();
        let Some((tag, address)) = value.split_once(':') else {
            return Err(SourceParseError::MissingType(value.to_string()));
        };
        let tag = tag.trim().to_ascii_lowercase();
        match tag.as_str() {
            "usb" => address
                .trim()
                .parse::<u32>()
                .map(|index| SourceDescriptor::Usb { index })
                .map_err(|_| SourceParseError::BadUsbIndex(address.to_string())),
            "file" => {
                let path = PathBuf::from(address.trim());
                if !path.is_file() {
                    return Err(SourceParseError::MissingFile(path));
                }
                Ok(SourceDescriptor::File { path })
            }
            "stub" => parse_synthetic(address),
            other if network_tags.iter().any(|t| t.eq_ignore_ascii_case(other)) => {
                Url::parse(value).map_err(|err| SourceParseError::InvalidUrl {
                    scheme: other.to_string(),
                    url: value.to_string(),
                    reason: err.to_string(),
                })?;
                Ok(SourceDescriptor::Network {
                    scheme: other.to_string(),
                    url: value.to_string(),
                })
            }
            other => Err(SourceParseError::UnsupportedType(other.to_string())),
        }
    }

    pub fn type_tag(&self) -> &str {
        match self {
            SourceDescriptor::Usb { .. } => "usb",
            SourceDescriptor::File { .. } => "file",
            SourceDescriptor::Network { scheme, .. } => scheme,
            SourceDescriptor::Synthetic { .. } => "stub",
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, SourceDescriptor::File { .. })
    }

    pub fn is_rtsp(&self) -> bool {
        matches!(self, SourceDescriptor::Network { scheme, .. } if scheme == "rtsp")
    }

    /// Address handed to capture libraries (device node, path or URL).
    pub fn media_address(&self) -> String {
        match self {
            SourceDescriptor::Usb { index } => format!("/dev/video{}", index),
            SourceDescriptor::File { path } => path.display().to_string(),
            SourceDescriptor::Network { url, .. } => url.clone(),
            SourceDescriptor::Synthetic { label, .. } => format!("stub:{}", label),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            SourceDescriptor::File { path } => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Usb { index } => write!(f, "usb:{}", index),
            SourceDescriptor::File { path } => write!(f, "file:{}", path.display()),
            SourceDescriptor::Network { url, .. } => f.write_str(url),
            SourceDescriptor::Synthetic { label, .. } => write!(f, "stub:{}", label),
        }
    }
}

fn parse_synthetic(address: &str) -> Result<SourceDescriptor, SourceParseError> {
    let (label, query) = match address.split_once('?') {
        Some((label, query)) => (label, Some(query)),
        None => (address, None),
    };
    let mut params = SyntheticParams::default();
    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        if pair.is_empty() {
            continue;
        }
        let bad = || SourceParseError::BadSyntheticParam(pair.to_string());
        let (key, value) = pair.split_once('=').ok_or_else(bad)?;
        match key {
            "width" => params.width = value.parse().ok().filter(|v| *v > 0).ok_or_else(bad)?,
            "height" => params.height = value.parse().ok().filter(|v| *v > 0).ok_or_else(bad)?,
            "fps" => params.fps = value.parse().ok().filter(|v: &f64| *v > 0.0).ok_or_else(bad)?,
            _ => return Err(bad()),
        }
    }
    Ok(SourceDescriptor::Synthetic {
        label: label.trim_start_matches('/').to_string(),
        params,
    })
}
