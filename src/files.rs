//! Stored-file management under the configured storage root.
//!
//! Each collection owns one subdirectory; a document's payload is stored
//! as `{document_id}{extension}`. Identifiers are restricted to
//! `[A-Za-z0-9_-]+` and extensions to `.[A-Za-z0-9]+` so a path can never
//! escape the root.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Validate an id for use as a path component.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a file extension (including the leading dot).
pub fn valid_extension(ext: &str) -> bool {
    let mut chars = ext.chars();
    chars.next() == Some('.') && {
        let rest: Vec<char> = chars.collect();
        !rest.is_empty() && rest.iter().all(|c| c.is_ascii_alphanumeric())
    }
}

/// Derive a safe storage extension from a filename; defaults to `.bin`.
pub fn extension_of(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!(".{}", ext.to_lowercase())
        }
        _ => ".bin".to_string(),
    }
}

/// Compute the storage path for a document file.
pub fn file_path(root: &Path, collection_id: &str, document_id: &str, ext: &str) -> Result<PathBuf> {
    if !valid_id(collection_id) {
        return Err(Error::Validation(format!(
            "invalid collection id: {}",
            collection_id
        )));
    }
    if !valid_id(document_id) {
        return Err(Error::Validation(format!(
            "invalid document id: {}",
            document_id
        )));
    }
    if !valid_extension(ext) {
        return Err(Error::Validation(format!("invalid extension: {}", ext)));
    }
    Ok(root
        .join(collection_id)
        .join(format!("{}{}", document_id, ext)))
}

/// Write a document payload, creating the collection directory on demand.
pub async fn store_file(
    root: &Path,
    collection_id: &str,
    document_id: &str,
    ext: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let path = file_path(root, collection_id, document_id, ext)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Validation(format!("cannot create storage dir: {}", e)))?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| Error::Validation(format!("cannot write file: {}", e)))?;
    Ok(path)
}

/// Read a stored payload back.
pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::Validation(format!("cannot read {}: {}", path.display(), e)))
}

/// Remove a stored file. A file that is already gone is not an error.
pub async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove stored file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_validation() {
        assert!(valid_id("a1B2_-"));
        assert!(valid_id("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!valid_id(""));
        assert!(!valid_id("../escape"));
        assert!(!valid_id("has space"));
        assert!(!valid_id("dot.dot"));
    }

    #[test]
    fn extension_validation() {
        assert!(valid_extension(".pdf"));
        assert!(valid_extension(".tar")); // single-segment only
        assert!(!valid_extension("pdf"));
        assert!(!valid_extension("."));
        assert!(!valid_extension(".p/df"));
        assert!(!valid_extension(".a.b"));
    }

    #[test]
    fn extension_derivation() {
        assert_eq!(extension_of("report.PDF"), ".pdf");
        assert_eq!(extension_of("notes.md"), ".md");
        assert_eq!(extension_of("no_extension"), ".bin");
        assert_eq!(extension_of("weird.!!"), ".bin");
    }

    #[test]
    fn path_rejects_traversal() {
        let root = Path::new("/data/files");
        assert!(file_path(root, "..", "doc", ".pdf").is_err());
        assert!(file_path(root, "col", "../../etc/passwd", ".pdf").is_err());
        assert!(file_path(root, "col", "doc", ".p-df").is_err());

        let ok = file_path(root, "col", "doc", ".pdf").unwrap();
        assert_eq!(ok, PathBuf::from("/data/files/col/doc.pdf"));
    }

    #[tokio::test]
    async fn store_read_remove_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = store_file(tmp.path(), "col1", "doc1", ".txt", b"payload")
            .await
            .unwrap();
        assert_eq!(read_file(&path).await.unwrap(), b"payload");

        remove_file(&path).await;
        assert!(read_file(&path).await.is_err());
        // Second removal is a no-op, not an error.
        remove_file(&path).await;
    }
}
