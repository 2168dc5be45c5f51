//! Local naming rules for downloaded attachments.

use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Rule mapping (record, attachment) identity to a local path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingPolicy {
    /// One directory per record: `{layer}/{record}/{attachment}-{name}`.
    #[default]
    IndividualFolder,
    /// One directory per layer: `{layer}/{record}-{attachment}-{name}`.
    GroupedFolder,
}

impl NamingPolicy {
    /// Target path of an attachment under this policy.
    #[must_use]
    pub fn compute_path(
        self,
        layer_folder: &Path,
        record_id: i64,
        attachment_id: i64,
        attachment_name: &str,
    ) -> PathBuf {
        let name = attachment_file_name(attachment_name);
        match self {
            Self::IndividualFolder => layer_folder
                .join(record_id.to_string())
                .join(format!("{attachment_id}-{name}")),
            Self::GroupedFolder => layer_folder.join(format!("{record_id}-{attachment_id}-{name}")),
        }
    }

    /// Files previously stored for `record_id`, sorted by path. Missing
    /// directories yield an empty list. In-flight temp files are ignored.
    pub async fn record_files(self, layer_folder: &Path, record_id: i64) -> Result<Vec<PathBuf>> {
        let (dir, prefix) = match self {
            Self::IndividualFolder => (layer_folder.join(record_id.to_string()), None),
            Self::GroupedFolder => (layer_folder.to_path_buf(), Some(format!("{record_id}-"))),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if prefix.as_deref().is_some_and(|p| !name.starts_with(p)) {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

impl FromStr for NamingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "individual-folder" | "IndividualFolder" => Ok(Self::IndividualFolder),
            "grouped-folder" | "GroupedFolder" => Ok(Self::GroupedFolder),
            other => Err(Error::Config(format!(
                "attachment storage option not valid: {other:?}, valid options are individual-folder and grouped-folder"
            ))),
        }
    }
}

impl fmt::Display for NamingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndividualFolder => f.write_str("individual-folder"),
            Self::GroupedFolder => f.write_str("grouped-folder"),
        }
    }
}

/// Folder name for a layer: positional index followed by the layer name with
/// everything outside `[A-Za-z0-9]` stripped.
#[must_use]
pub fn layer_folder_name(index: usize, layer_name: &str) -> String {
    let sanitized: String = layer_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    format!("{index}{sanitized}")
}

/// Attachment display name with path separators replaced, so a name can
/// never escape its target directory.
fn attachment_file_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Conjunction of the tautological base predicate with an optional filter.
#[must_use]
pub fn combine_filter(row_filter: Option<&str>) -> String {
    match row_filter.map(str::trim) {
        Some(filter) if !filter.is_empty() => format!("1=1 AND ({filter})"),
        _ => "1=1".to_string(),
    }
}
