//! Filesystem helpers for the receive path.
//!
//! Incoming files land in the download directory under a collision-free
//! name, written to a `.part` sibling first and renamed into place so a
//! crash mid-write never leaves a file that looks complete.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;

/// Metadata for a local file, as presented to a front-end picking what to
/// send.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    /// Absolute path.
    pub path: PathBuf,
    pub size: u64,
    /// Unix milliseconds of the last modification, 0 when unavailable.
    pub modified: i64,
    pub mime_type: String,
}

/// Stat a file and classify it by extension.
pub fn file_info(path: &Path) -> Result<FileInfo> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("file not found: {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("not a regular file: {}", path.display());
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("invalid file name: {}", path.display()))?;
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    Ok(FileInfo {
        name,
        path: absolute,
        size: metadata.len(),
        modified,
        mime_type: detect_mime_type(path).to_string(),
    })
}

/// Extension-based MIME classification; unknown extensions are opaque bytes.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Platform download directory, with fallbacks for headless systems.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// First non-existing destination for `file_name` inside `dir`.
///
/// `report.pdf` collides → `report_1.pdf`, `report_2.pdf`, … The numbering
/// sits before the extension so the file type stays recognizable.
pub fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let extension = original.extension().and_then(|s| s.to_str());

    let mut counter = 1u32;
    loop {
        let name = match extension {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let path = dir.join(&name);
        if !path.exists() {
            return path;
        }
        counter += 1;
    }
}

/// Write `content` to `path` via a `.part` sibling and an atomic rename.
///
/// Parent directories are created if absent. On rename failure the partial
/// file is cleaned up.
pub fn write_file_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let tmp_path = path.with_file_name(format!("{file_name}.part"));

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "partial_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write partial file"
        );
        anyhow::Error::new(e).context(format!("failed to write {}", tmp_path.display()))
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "finalize_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename partial file into place"
        );
        let _ = std::fs::remove_file(&tmp_path);
        anyhow::Error::new(e).context(format!("failed to finalize {}", path.display()))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn unique_destination_prefers_original_name() {
        let dir = scratch_dir("landrop_test_unique1");
        assert_eq!(unique_destination(&dir, "a.txt"), dir.join("a.txt"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unique_destination_counts_past_collisions() {
        let dir = scratch_dir("landrop_test_unique2");
        std::fs::write(dir.join("a.txt"), b"x").unwrap();
        std::fs::write(dir.join("a_1.txt"), b"x").unwrap();
        assert_eq!(unique_destination(&dir, "a.txt"), dir.join("a_2.txt"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unique_destination_without_extension() {
        let dir = scratch_dir("landrop_test_unique3");
        std::fs::write(dir.join("README"), b"x").unwrap();
        assert_eq!(unique_destination(&dir, "README"), dir.join("README_1"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn atomic_write_leaves_no_partial_file() {
        let dir = scratch_dir("landrop_test_atomic");
        let path = dir.join("out.bin");

        write_file_atomic(&path, b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        assert!(!dir.join("out.bin.part").exists());

        // Overwrite works too.
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let dir = scratch_dir("landrop_test_atomic2");
        let path = dir.join("nested/deeper/out.bin");
        write_file_atomic(&path, b"data").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn mime_detection_by_extension() {
        assert_eq!(detect_mime_type(Path::new("a.txt")), "text/plain");
        assert_eq!(detect_mime_type(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(detect_mime_type(Path::new("page.htm")), "text/html");
        assert_eq!(
            detect_mime_type(Path::new("blob.weird")),
            "application/octet-stream"
        );
        assert_eq!(
            detect_mime_type(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[test]
    fn file_info_stats_a_regular_file() {
        let dir = scratch_dir("landrop_test_fileinfo");
        let path = dir.join("doc.pdf");
        std::fs::write(&path, b"%PDF-").unwrap();

        let info = file_info(&path).unwrap();
        assert_eq!(info.name, "doc.pdf");
        assert_eq!(info.size, 5);
        assert_eq!(info.mime_type, "application/pdf");
        assert!(info.modified > 0);

        assert!(file_info(&dir).is_err());
        assert!(file_info(&dir.join("missing")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
