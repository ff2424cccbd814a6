//! In-memory bundle store.
//!
//! A bundle is read once at startup and never changes afterwards. Every
//! non-directory archive entry is kept under its path prefixed with `/`.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use crate::error::FabError;

/// Path of the entry program inside every bundle.
pub const ENTRY_PATH: &str = "/server.js";

/// Immutable path -> bytes mapping extracted from a FAB archive.
#[derive(Debug, Clone)]
pub struct Bundle {
    files: HashMap<String, Bytes>,
}

impl Bundle {
    /// Read a bundle archive from disk.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FabError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| FabError::archive_read(format!("{}: {e}", path.display())))?;
        Self::from_archive(&data)
    }

    /// Extract a bundle from zip archive bytes.
    pub fn from_archive(data: &[u8]) -> Result<Self, FabError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))
            .map_err(|e| FabError::archive_read(e.to_string()))?;

        let mut files = HashMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| FabError::archive_read(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }

            let name = format!("/{}", entry.name());
            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(|e| FabError::archive_read(format!("{name}: {e}")))?;

            debug!(path = %name, size = contents.len(), "Extracted bundle entry");
            files.insert(name, Bytes::from(contents));
        }

        Self::from_files(files)
    }

    /// Build a bundle from an already-extracted file map.
    pub fn from_files<K, V>(files: impl IntoIterator<Item = (K, V)>) -> Result<Self, FabError>
    where
        K: Into<String>,
        V: Into<Bytes>,
    {
        let files: HashMap<String, Bytes> = files
            .into_iter()
            .map(|(path, contents)| (path.into(), contents.into()))
            .collect();

        if !files.contains_key(ENTRY_PATH) {
            return Err(FabError::MalformedBundle {
                entry: ENTRY_PATH.to_string(),
            });
        }

        Ok(Self { files })
    }

    /// Look up an entry by absolute path.
    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path)
    }

    /// Source text of the entry program.
    pub fn entry_source(&self) -> Result<&str, FabError> {
        let bytes = self.get(ENTRY_PATH).ok_or_else(|| FabError::MalformedBundle {
            entry: ENTRY_PATH.to_string(),
        })?;
        std::str::from_utf8(bytes)
            .map_err(|e| FabError::renderer_load(format!("{ENTRY_PATH} is not valid UTF-8: {e}")))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Always `false`: a valid bundle holds at least the entry program.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Iterate over all entry paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build a stored (uncompressed) zip archive in memory.
    fn zip_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, contents) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_from_archive_prefixes_paths() {
        let data = zip_archive(&[
            ("server.js", b"module.exports = {}"),
            ("_assets/", b""),
            ("_assets/app.css", b"body{}"),
        ]);
        let bundle = Bundle::from_archive(&data).unwrap();

        assert_eq!(bundle.len(), 2);
        assert_eq!(
            bundle.get("/_assets/app.css").map(|b| b.as_ref()),
            Some(&b"body{}"[..])
        );
        assert!(bundle.get("/_assets/").is_none());
        assert!(bundle.get("_assets/app.css").is_none());
    }

    #[test]
    fn test_missing_entry_is_malformed() {
        let data = zip_archive(&[("index.html", b"<html></html>")]);
        let err = Bundle::from_archive(&data).unwrap_err();
        assert!(matches!(err, FabError::MalformedBundle { .. }));
    }

    #[test]
    fn test_corrupt_archive() {
        let err = Bundle::from_archive(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, FabError::ArchiveRead { .. }));
    }

    #[test]
    fn test_entry_source_requires_utf8() {
        let bundle = Bundle::from_files([(ENTRY_PATH, vec![0xff, 0xfe, 0x00])]).unwrap();
        let err = bundle.entry_source().unwrap_err();
        assert!(matches!(err, FabError::RendererLoad { .. }));

        let bundle = Bundle::from_files([(ENTRY_PATH, "exports.x = 1")]).unwrap();
        assert_eq!(bundle.entry_source().unwrap(), "exports.x = 1");
    }

    #[tokio::test]
    async fn test_open_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.fab");
        std::fs::write(&file, zip_archive(&[("server.js", b"//")])).unwrap();

        let bundle = Bundle::open(&file).await.unwrap();
        assert!(bundle.get(ENTRY_PATH).is_some());

        let err = Bundle::open(dir.path().join("missing.fab")).await.unwrap_err();
        assert!(matches!(err, FabError::ArchiveRead { .. }));
    }
}
