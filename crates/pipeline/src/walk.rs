//! Source tree discovery.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use vitrine_media::MediaKind;

/// A supported media file below the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Directory path relative to the source root, joined with `/`.
    pub section: String,
    pub kind: MediaKind,
    /// Lowercase, without the dot.
    pub extension: String,
}
impl SourceFile {
    pub fn file_name(&self) -> String {
        self.path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(|name| name.to_str()).is_some_and(|name| name.starts_with('.'))
}

/// Section name for a file, or `None` for files directly in the root.
fn section_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.parent()?;
    let segments: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// Find every supported media file below `root`, sorted by path.
///
/// Hidden files and directories are skipped, as are files with extensions
/// outside the allow-lists. Symbolic links to files are followed; symbolic
/// links to directories are not. Any unreadable directory aborts the walk.
#[tracing::instrument(skip_all, fields(root = %root.display()))]
pub async fn discover(root: &Path) -> Result<Vec<SourceFile>> {
    let is_dir = fs::metadata(root).await.is_ok_and(|m| m.is_dir());
    if !is_dir {
        exn::bail!(ErrorKind::SourceRoot(root.to_path_buf()));
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await.or_raise(|| ErrorKind::Walk(current.clone()))?;
        while let Some(entry) = entries.next_entry().await.or_raise(|| ErrorKind::Walk(current.clone()))? {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }
            let file_type = entry.file_type().await.or_raise(|| ErrorKind::Walk(current.clone()))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let is_file = file_type.is_file()
                || (file_type.is_symlink() && fs::metadata(&path).await.is_ok_and(|m| m.is_file()));
            if !is_file {
                continue;
            }
            let Some(kind) = MediaKind::from_path(&path) else {
                tracing::trace!(path = %path.display(), "Ignoring unsupported file");
                continue;
            };
            let Some(section) = section_of(root, &path) else {
                tracing::debug!(path = %path.display(), "Ignoring file outside of any section");
                continue;
            };
            let extension = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase()).unwrap_or_default();
            tracing::debug!(path = %path.display(), %section, %kind, "Discovered");
            files.push(SourceFile { path, section, kind, extension });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(files = files.len(), "Source walk complete");
    Ok(files)
}
