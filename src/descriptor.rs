//! Source list files.
//!
//! One source per line: `name,type:address[,fps]`. Blank lines and lines starting
//! with `#` are ignored. An fps of `-1` or `0` (or no third field) means "use the
//! source-reported frame rate".

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::ingest::source::DEFAULT_NETWORK_TAGS;
use crate::ingest::{SourceDescriptor, SourceParseError};

/// One parsed line of a source list.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceEntry {
    pub name: String,
    pub descriptor: SourceDescriptor,
    pub manual_fps: Option<f64>,
}

impl SourceEntry {
    pub fn new(name: impl Into<String>, descriptor: SourceDescriptor) -> Self {
        Self {
            name: name.into(),
            descriptor,
            manual_fps: None,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.manual_fps = Some(fps);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntryError {
    #[error("expected `name,type:address[,fps]`, got {0} field(s)")]
    FieldCount(usize),
    #[error("source name is empty")]
    EmptyName,
    #[error("fps {0:?} is not a positive number, 0 or -1")]
    BadFps(String),
    #[error(transparent)]
    Source(#[from] SourceParseError),
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read source list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {kind}")]
    Invalid { line: usize, kind: EntryError },
}

/// Parse a single `name,type:address[,fps]` entry.
pub fn parse_entry(line: &str, network_tags: &[&str]) -> Result<SourceEntry, EntryError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if !(2..=3).contains(&fields.len()) {
        return Err(EntryError::FieldCount(fields.len()));
    }
    let name = fields[0];
    if name.is_empty() {
        return Err(EntryError::EmptyName);
    }
    let descriptor = SourceDescriptor::parse_with(fields[1], network_tags)?;
    let manual_fps = match fields.get(2) {
        None => None,
        Some(raw) => parse_fps(raw)?,
    };
    Ok(SourceEntry {
        name: name.to_string(),
        descriptor,
        manual_fps,
    })
}

fn parse_fps(raw: &str) -> Result<Option<f64>, EntryError> {
    let fps: f64 = raw
        .parse()
        .map_err(|_| EntryError::BadFps(raw.to_string()))?;
    if fps == -1.0 || fps == 0.0 {
        return Ok(None);
    }
    if !fps.is_finite() || fps <= 0.0 {
        return Err(EntryError::BadFps(raw.to_string()));
    }
    Ok(Some(fps))
}

/// Parse every entry of a source list. Fails on the first malformed line.
pub fn parse_source_list(
    text: &str,
    network_tags: &[&str],
) -> Result<Vec<SourceEntry>, DescriptorError> {
    let mut entries = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_entry(line, network_tags).map_err(|kind| DescriptorError::Invalid {
            line: index + 1,
            kind,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Read and parse a source list file, approving the default network tags.
pub fn load_source_list(path: &Path) -> Result<Vec<SourceEntry>, DescriptorError> {
    let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_source_list(&text, DEFAULT_NETWORK_TAGS)
}

/// True when there is at least one entry and every entry is a local file.
pub fn all_files(entries: &[SourceEntry]) -> bool {
    !entries.is_empty() && entries.iter().all(|entry| entry.descriptor.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_entry_with_and_without_fps() {
        let entry = parse_entry("cam1,rtsp://h/s", DEFAULT_NETWORK_TAGS).unwrap();
        assert_eq!(entry.name, "cam1");
        assert!(entry.descriptor.is_rtsp());
        assert_eq!(entry.manual_fps, None);

        let entry = parse_entry("cam1, rtsp://h/s , 12.5", DEFAULT_NETWORK_TAGS).unwrap();
        assert_eq!(entry.manual_fps, Some(12.5));

        let entry = parse_entry("cam1,rtsp://h/s,-1", DEFAULT_NETWORK_TAGS).unwrap();
        assert_eq!(entry.manual_fps, None);

        let entry = parse_entry("cam1,rtsp://h/s,0", DEFAULT_NETWORK_TAGS).unwrap();
        assert_eq!(entry.manual_fps, None);
    }

    #[test]
    fn rejects_malformed_entries() {
        assert_eq!(
            parse_entry("cam1", DEFAULT_NETWORK_TAGS),
            Err(EntryError::FieldCount(1))
        );
        assert_eq!(
            parse_entry(",usb:0", DEFAULT_NETWORK_TAGS),
            Err(EntryError::EmptyName)
        );
        assert_eq!(
            parse_entry("cam,usb:0,-2", DEFAULT_NETWORK_TAGS),
            Err(EntryError::BadFps("-2".to_string()))
        );
        assert_eq!(
            parse_entry("cam,usb:0,fast", DEFAULT_NETWORK_TAGS),
            Err(EntryError::BadFps("fast".to_string()))
        );
        assert!(matches!(
            parse_entry("cam,usb:front", DEFAULT_NETWORK_TAGS),
            Err(EntryError::Source(SourceParseError::BadUsbIndex(_)))
        ));
        assert!(matches!(
            parse_entry("cam,ftp://h/s", DEFAULT_NETWORK_TAGS),
            Err(EntryError::Source(SourceParseError::UnsupportedType(_)))
        ));
    }

    #[test]
    fn caller_approved_tags_are_network_sources() {
        let tags = ["rtsp", "rtmp"];
        let entry = parse_entry("cam,rtmp://h/live", &tags).unwrap();
        assert_eq!(entry.descriptor.type_tag(), "rtmp");
    }

    #[test]
    fn list_skips_comments_and_reports_line_numbers() {
        let text = "# cameras\n\ncam1,usb:0\ncam2,stub:yard\ncam3,usb:x\n";
        match parse_source_list(text, DEFAULT_NETWORK_TAGS) {
            Err(DescriptorError::Invalid { line, kind }) => {
                assert_eq!(line, 5);
                assert!(matches!(kind, EntryError::Source(_)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let entries = parse_source_list("# x\ncam1,usb:0\ncam2,stub:yard\n", DEFAULT_NETWORK_TAGS)
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!all_files(&entries));
        assert!(!all_files(&[]));
    }
}
