//! Rule list sources.
//!
//! A filter's rules live either in a file on disk or in an in-memory blob.
//! The index stores byte offsets into the source instead of rule objects, so
//! the source must be addressable by offset for the life of the filter:
//! [`RuleSource::line_at`] re-reads the line starting at a recorded offset.

use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::SystemTime;

/// Parameters of one filter list.
#[derive(Debug, Clone)]
pub struct FilterParams {
    /// Numeric id reported in events for rules of this list.
    pub id: i32,
    /// Rule blob when `in_memory`, a filesystem path otherwise.
    pub data: String,
    pub in_memory: bool,
}

impl FilterParams {
    /// A file-backed filter list.
    pub fn from_file(id: i32, path: impl Into<String>) -> Self {
        Self {
            id,
            data: path.into(),
            in_memory: false,
        }
    }

    /// An in-memory filter list.
    pub fn in_memory(id: i32, rules: impl Into<String>) -> Self {
        Self {
            id,
            data: rules.into(),
            in_memory: true,
        }
    }
}

enum SourceKind {
    File(PathBuf),
    Memory(String),
}

/// A rule list addressable line-by-line and by byte offset.
pub struct RuleSource {
    kind: SourceKind,
    /// Modification time captured when the source was opened; files only.
    mtime: Option<SystemTime>,
}

impl RuleSource {
    pub fn open(params: &FilterParams) -> std::io::Result<Self> {
        if params.in_memory {
            Ok(Self {
                kind: SourceKind::Memory(params.data.clone()),
                mtime: None,
            })
        } else {
            let path = PathBuf::from(&params.data);
            // read once up front so a missing file fails the load, not the match
            let mtime = fs::metadata(&path)?.modified().ok();
            Ok(Self {
                kind: SourceKind::File(path),
                mtime,
            })
        }
    }

    /// Whether a file-backed source changed on disk since it was opened.
    /// In-memory sources never go out of date.
    #[must_use]
    pub fn is_outdated(&self) -> bool {
        match &self.kind {
            SourceKind::Memory(_) => false,
            SourceKind::File(path) => {
                let current = fs::metadata(path).and_then(|m| m.modified()).ok();
                current.is_none() || current != self.mtime
            }
        }
    }

    /// Invoke `action(offset, trimmed_line)` for every line. The offset is the
    /// byte position of the raw line start. Returning `false` stops the walk.
    ///
    /// Every non-empty line is emitted exactly once, whether or not the source
    /// ends with a newline.
    pub fn for_each_line(
        &self,
        mut action: impl FnMut(u32, &str) -> bool,
    ) -> std::io::Result<()> {
        match &self.kind {
            SourceKind::Memory(data) => {
                iterate_lines(data, &mut action);
                Ok(())
            }
            SourceKind::File(path) => {
                let content = fs::read(path)?;
                iterate_lines(&String::from_utf8_lossy(&content), &mut action);
                Ok(())
            }
        }
    }

    /// The trimmed line starting at byte `offset`, or `None` when the offset
    /// is out of range.
    pub fn line_at(&self, offset: u32) -> std::io::Result<Option<String>> {
        let offset = offset as usize;
        match &self.kind {
            SourceKind::Memory(data) => Ok(slice_line(data, offset)),
            SourceKind::File(path) => {
                let mut file = fs::File::open(path)?;
                file.seek(SeekFrom::Start(offset as u64))?;
                let mut buf = Vec::new();
                BufReader::new(file).read_until(b'\n', &mut buf)?;
                if buf.is_empty() {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&buf);
                Ok(slice_line(&text, 0))
            }
        }
    }

    /// A short human-readable description for log messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.kind {
            SourceKind::Memory(_) => "in-memory".to_string(),
            SourceKind::File(path) => path.display().to_string(),
        }
    }
}

fn iterate_lines(content: &str, action: &mut impl FnMut(u32, &str) -> bool) {
    let bytes = content.as_bytes();
    let mut line_start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'\n' || b == b'\r' {
            let line = content[line_start..i].trim();
            if !line.is_empty() && !action(line_start as u32, line) {
                return;
            }
            line_start = i + 1;
        }
    }
    if line_start < bytes.len() {
        let line = content[line_start..].trim();
        if !line.is_empty() {
            action(line_start as u32, line);
        }
    }
}

fn slice_line(data: &str, offset: usize) -> Option<String> {
    let rest = data.get(offset..)?;
    let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}
