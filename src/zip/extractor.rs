use flate2::read::DeflateDecoder;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::SfxError;
use crate::io::{LocalFileReader, ReadAt};
use anyhow::{Result, bail};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// ZIP file extractor over an opened archive
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
    entries: Vec<ZipFileEntry>,
}

impl<R: ReadAt> ZipExtractor<R> {
    /// Open an archive by reading its central directory.
    ///
    /// Fails with [`SfxError::NotAnArchive`] when the data has no valid
    /// trailing index, regardless of what precedes the archive.
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        let parser = ZipParser::new(reader);
        let entries = parser.list_files().await?;
        Ok(Self { parser, entries })
    }

    /// All entries in central directory order
    pub fn entries(&self) -> &[ZipFileEntry] {
        &self.entries
    }

    /// Extract file data to memory
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        if let CompressionMethod::Unknown(method) = entry.compression_method {
            bail!(SfxError::UnsupportedCompression(method));
        }

        // Get data offset
        let data_offset = self.parser.get_data_offset(entry).await?;
        let reader = self.parser.reader();
        if data_offset.saturating_add(entry.compressed_size) > reader.size() {
            bail!(corrupt(entry, "data extends past end of file"));
        }

        // Read raw file data
        let mut raw = vec![0u8; entry.compressed_size as usize];
        reader.read_exact_at(data_offset, &mut raw).await?;

        let data = match entry.compression_method {
            CompressionMethod::Deflate => {
                let mut data = Vec::with_capacity(entry.uncompressed_size as usize);
                DeflateDecoder::new(&raw[..])
                    .take(entry.uncompressed_size + 1)
                    .read_to_end(&mut data)
                    .map_err(|e| corrupt(entry, &e.to_string()))?;
                data
            }
            _ => raw,
        };

        if data.len() as u64 != entry.uncompressed_size {
            bail!(corrupt(
                entry,
                &format!(
                    "expected {} bytes, found {}",
                    entry.uncompressed_size,
                    data.len()
                )
            ));
        }
        if crc32fast::hash(&data) != entry.crc32 {
            bail!(corrupt(entry, "CRC-32 mismatch"));
        }

        Ok(data)
    }

    /// Extract file to disk with the given permission bits and mtime.
    ///
    /// Returns the number of bytes written.
    pub async fn extract_to_file(
        &self,
        entry: &ZipFileEntry,
        output_path: &Path,
        permissions: u32,
        modified: SystemTime,
    ) -> Result<u64> {
        // Create parent directories if needed
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        // Extract data
        let data = self.extract_to_memory(entry).await?;

        // Write to file
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(permissions);
        let mut file = options.open(output_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;

        // The creation mode is filtered by the umask; apply the bits as recorded
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(output_path, std::fs::Permissions::from_mode(permissions)).await?;
        }
        #[cfg(not(unix))]
        let _ = permissions;

        let file = file.into_std().await;
        file.set_modified(modified)?;

        Ok(data.len() as u64)
    }
}

impl ZipExtractor<LocalFileReader> {
    /// Open the archive stored in (or appended to) a file on disk
    pub async fn open_path(path: &Path) -> Result<Self> {
        Self::open(Arc::new(LocalFileReader::new(path)?)).await
    }
}

fn corrupt(entry: &ZipFileEntry, reason: &str) -> SfxError {
    SfxError::Corrupt {
        name: entry.file_name.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::zip::{EntryOptions, ZipWriter};
    use std::time::{Duration, UNIX_EPOCH};

    async fn open_bytes(data: Vec<u8>) -> ZipExtractor<MemoryReader> {
        ZipExtractor::open(Arc::new(MemoryReader::new(data)))
            .await
            .unwrap()
    }

    fn single_file(content: &[u8], method: CompressionMethod) -> Vec<u8> {
        let options = EntryOptions::new(0o600, UNIX_EPOCH + Duration::from_secs(1_650_000_000))
            .with_method(method);
        let mut writer = ZipWriter::new(Vec::new());
        writer.add_file("f.txt", &options, &mut &content[..]).unwrap();
        writer.finish().unwrap()
    }

    #[tokio::test]
    async fn test_crc_mismatch_detected() {
        let mut data = single_file(b"payload", CompressionMethod::Stored);
        // Flip a byte of the stored content, right after the 30-byte header,
        // the 5-byte name and the 9-byte timestamp field
        data[30 + 5 + 9] ^= 0xFF;

        let extractor = open_bytes(data).await;
        let err = extractor
            .extract_to_memory(&extractor.entries()[0])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SfxError>(),
            Some(SfxError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let extractor = open_bytes(single_file(b"x", CompressionMethod::Stored)).await;
        let mut entry = extractor.entries()[0].clone();
        entry.compression_method = CompressionMethod::Unknown(14);
        let err = extractor.extract_to_memory(&entry).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SfxError>(),
            Some(SfxError::UnsupportedCompression(14))
        ));
    }

    #[tokio::test]
    async fn test_extract_to_file_applies_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        let content = b"line one\nline two\n".repeat(100);
        let extractor = open_bytes(single_file(&content, CompressionMethod::Deflate)).await;
        let entry = extractor.entries()[0].clone();

        let output = temp_dir.path().join("nested/dir/f.txt");
        let written = extractor
            .extract_to_file(&entry, &output, entry.permissions(), entry.modified())
            .await
            .unwrap();

        assert_eq!(written, content.len() as u64);
        assert_eq!(std::fs::read(&output).unwrap(), content);

        let metadata = std::fs::metadata(&output).unwrap();
        assert_eq!(
            metadata.modified().unwrap(),
            UNIX_EPOCH + Duration::from_secs(1_650_000_000)
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(metadata.permissions().mode() & 0o7777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_open_path_with_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let prefix = vec![0x7Fu8; 70_000];
        let mut writer = ZipWriter::new(prefix.clone());
        writer.set_offset(prefix.len() as u64).unwrap();
        writer
            .add_file("a", &EntryOptions::new(0o644, UNIX_EPOCH), &mut &b"abc"[..])
            .unwrap();
        let path = temp_dir.path().join("prefixed.bin");
        std::fs::write(&path, writer.finish().unwrap()).unwrap();

        let extractor = ZipExtractor::open_path(&path).await.unwrap();
        assert_eq!(extractor.entries().len(), 1);
        assert_eq!(
            extractor.extract_to_memory(&extractor.entries()[0]).await.unwrap(),
            b"abc"
        );
    }
}
