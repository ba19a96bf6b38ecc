//! UploadedArchive validation: defends against zip bombs, path traversal,
//! and symlink smuggling before any bundle byte is persisted.

use std::io::{Cursor, Read};

use thiserror::Error;

const SYMLINK_MODE_MASK: u32 = 0o170000;
const SYMLINK_MODE: u32 = 0o120000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZipValidationError {
    #[error("archive is not a valid zip")]
    NotAZip,
    #[error("archive has too many entries (max {max})")]
    TooManyFiles { max: usize },
    #[error("entry '{name}' escapes the sandbox root")]
    PathTraversal { name: String },
    #[error("entry '{name}' is a symlink")]
    Symlink { name: String },
    #[error("uncompressed size exceeds limit ({limit} bytes)")]
    TooLarge { limit: u64 },
    #[error("compression ratio {ratio} exceeds limit {limit}")]
    RatioExceeded { ratio: u64, limit: u64 },
    #[error("archive contains no .sol entry")]
    MissingSolEntry,
    #[error("failed to read entry '{name}'")]
    UnreadableEntry { name: String },
}

pub struct ZipValidationPolicy {
    pub max_files: usize,
    pub max_uncompressed_bytes: u64,
    pub max_ratio: u64,
    pub require_sol_entry: bool,
}

impl Default for ZipValidationPolicy {
    fn default() -> Self {
        Self {
            max_files: 50_000,
            max_uncompressed_bytes: 30 * 1024 * 1024,
            max_ratio: 100,
            require_sol_entry: false,
        }
    }
}

/// Normalizes a zip entry name into a path relative to a virtual sandbox
/// root, rejecting any name that would escape it (`..` components, absolute
/// paths, or a name that resolves above the root after normalization).
fn normalize_sandbox_path(name: &str) -> Option<String> {
    let mut components: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                components.pop()?;
            }
            other => components.push(other),
        }
    }
    Some(components.join("/"))
}

fn is_symlink_entry(entry: &zip::read::ZipFile) -> bool {
    entry
        .unix_mode()
        .map(|mode| mode & SYMLINK_MODE_MASK == SYMLINK_MODE)
        .unwrap_or(false)
}

/// Validates `bytes` as a zip archive under `policy`. Returns the archive's
/// total uncompressed size on success, so the caller can record it without
/// re-scanning.
pub fn validate(bytes: &[u8], policy: &ZipValidationPolicy) -> Result<u64, ZipValidationError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|_| ZipValidationError::NotAZip)?;

    if archive.len() > policy.max_files {
        return Err(ZipValidationError::TooManyFiles { max: policy.max_files });
    }

    let mut total_uncompressed: u64 = 0;
    let mut has_sol_entry = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|_| ZipValidationError::UnreadableEntry {
            name: format!("#{i}"),
        })?;
        let name = entry.name().to_string();

        let normalized = normalize_sandbox_path(&name).ok_or_else(|| ZipValidationError::PathTraversal { name: name.clone() })?;
        if normalized.is_empty() && !entry.is_dir() {
            return Err(ZipValidationError::PathTraversal { name: name.clone() });
        }

        if is_symlink_entry(&entry) {
            return Err(ZipValidationError::Symlink { name: name.clone() });
        }

        // Drain the entry to get a trustworthy uncompressed size rather than
        // trusting the (attacker-controlled) central directory header.
        let mut sink = std::io::sink();
        let copied = std::io::copy(&mut entry, &mut sink).map_err(|_| ZipValidationError::UnreadableEntry { name: name.clone() })?;
        total_uncompressed += copied;

        if total_uncompressed > policy.max_uncompressed_bytes {
            return Err(ZipValidationError::TooLarge { limit: policy.max_uncompressed_bytes });
        }

        if normalized.ends_with(".sol") {
            has_sol_entry = true;
        }
    }

    let compressed_len = bytes.len() as u64;
    if compressed_len > 0 {
        let ratio = total_uncompressed / compressed_len.max(1);
        if ratio > policy.max_ratio {
            return Err(ZipValidationError::RatioExceeded { ratio, limit: policy.max_ratio });
        }
    }

    if policy.require_sol_entry && !has_sol_entry {
        return Err(ZipValidationError::MissingSolEntry);
    }

    Ok(total_uncompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options: zip::write::FileOptions<()> = zip::write::FileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn accepts_a_simple_archive() {
        let zip = build_zip(&[("one.sol", b"contract C {}")]);
        let policy = ZipValidationPolicy { require_sol_entry: true, ..Default::default() };
        assert!(validate(&zip, &policy).is_ok());
    }

    #[test]
    fn rejects_missing_sol_entry_when_required() {
        let zip = build_zip(&[("readme.md", b"hello")]);
        let policy = ZipValidationPolicy { require_sol_entry: true, ..Default::default() };
        assert_eq!(validate(&zip, &policy), Err(ZipValidationError::MissingSolEntry));
    }

    #[test]
    fn rejects_too_many_files() {
        let entries: Vec<(String, &[u8])> = (0..5).map(|i| (format!("f{i}.sol"), b"x" as &[u8])).collect();
        let refs: Vec<(&str, &[u8])> = entries.iter().map(|(n, d)| (n.as_str(), *d)).collect();
        let zip = build_zip(&refs);
        let policy = ZipValidationPolicy { max_files: 2, ..Default::default() };
        assert_eq!(validate(&zip, &policy), Err(ZipValidationError::TooManyFiles { max: 2 }));
    }

    #[test]
    fn every_accepted_path_stays_inside_sandbox_root() {
        assert_eq!(normalize_sandbox_path("a/b/c.sol").unwrap(), "a/b/c.sol");
        assert_eq!(normalize_sandbox_path("./a/../b.sol").unwrap(), "b.sol");
        assert!(normalize_sandbox_path("../escape.sol").is_none());
        assert!(normalize_sandbox_path("a/../../escape.sol").is_none());
    }

    #[test]
    fn rejects_oversized_archive() {
        let huge = vec![0u8; 10_000];
        let zip = build_zip(&[("big.sol", &huge)]);
        let policy = ZipValidationPolicy { max_uncompressed_bytes: 100, ..Default::default() };
        assert_eq!(validate(&zip, &policy), Err(ZipValidationError::TooLarge { limit: 100 }));
    }
}
