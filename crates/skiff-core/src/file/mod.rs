//! Transfer-folder operations.
//!
//! A Skiff server serves files out of a single transfer folder and writes
//! inbound files into it. Listings are non-recursive, skip dot-prefixed
//! names, and keep directory order.
//!
//! On the wire a listing is a single string: entries joined with `"*"`,
//! each entry a path and a decimal size joined with `"|"`. The delimiters
//! are literal and unescaped; a path containing either character corrupts
//! the list. This mirrors the protocol as deployed and is a known weakness,
//! which is why decoding splits the size off the END of each entry.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Separator between the path and size fields of one entry.
const FIELD_SEPARATOR: char = '|';

/// Separator between entries.
const ENTRY_SEPARATOR: char = '*';

/// One file in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path of the file on the listing server
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl FileEntry {
    /// Build an entry from a path and size.
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// The file name portion of the path.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().to_string())
    }
}

/// Enumerate the files directly inside `folder`, in directory order.
///
/// Subdirectories and dot-prefixed names are skipped; there is no
/// recursion.
///
/// # Errors
///
/// Returns an error if the folder cannot be read.
pub async fn list_folder(folder: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(folder).await?;

    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        entries.push(FileEntry::new(entry.path(), metadata.len()));
    }

    Ok(entries)
}

/// Join entries into the wire text: `path "|" size ("*" path "|" size)*`.
pub fn encode_file_list(entries: &[FileEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}{}{}", e.path.display(), FIELD_SEPARATOR, e.size))
        .collect::<Vec<_>>()
        .join(&ENTRY_SEPARATOR.to_string())
}

/// Parse the wire text back into entries.
///
/// The size is split off the end of each entry, so a path containing the
/// field separator still decodes as long as it contains no entry separator.
///
/// # Errors
///
/// Returns `MalformedPayload` when an entry has no separator or a
/// non-decimal size.
pub fn decode_file_list(list: &str) -> Result<Vec<FileEntry>> {
    if list.is_empty() {
        return Ok(Vec::new());
    }

    list.split(ENTRY_SEPARATOR)
        .map(|entry| {
            let (path, size) = entry.rsplit_once(FIELD_SEPARATOR).ok_or_else(|| {
                Error::MalformedPayload(format!("file list entry without separator: {entry}"))
            })?;
            let size = size.parse::<u64>().map_err(|_| {
                Error::MalformedPayload(format!("bad file size in list entry: {size}"))
            })?;
            Ok(FileEntry::new(path, size))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let entries = vec![
            FileEntry::new("/srv/files/a.txt", 12),
            FileEntry::new("/srv/files/b.bin", 4096),
            FileEntry::new("/srv/files/empty", 0),
        ];
        let text = encode_file_list(&entries);
        assert_eq!(text, "/srv/files/a.txt|12*/srv/files/b.bin|4096*/srv/files/empty|0");
        assert_eq!(decode_file_list(&text).unwrap(), entries);
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(encode_file_list(&[]), "");
        assert!(decode_file_list("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_entries() {
        assert!(decode_file_list("no-separator").is_err());
        assert!(decode_file_list("/a|notanumber").is_err());
    }

    #[tokio::test]
    async fn test_list_folder_skips_dotfiles_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible.txt"), b"12345").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();
        std::fs::write(dir.path().join("subdir").join("nested.txt"), b"x").unwrap();

        let entries = list_folder(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name(), "visible.txt");
        assert_eq!(entries[0].size, 5);
    }

    #[tokio::test]
    async fn test_list_missing_folder_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_folder(&missing).await.is_err());
    }
}
