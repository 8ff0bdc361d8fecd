//! Self-extracting archives on top of the [`zip`](crate::zip) codec.
//!
//! A self-extracting archive is the builder's own executable followed by a
//! ZIP payload. One entry of the payload, [`SFX_KEY_NAME`], holds the
//! relative path of the script to run; every other entry is part of the
//! tree that gets unpacked.
//!
//! ```text
//! +---------------------------+
//! | sfx executable            |  copied verbatim, N bytes
//! +---------------------------+
//! | ~~~sfx~~~  (script path)  |
//! | directory and file data   |  local headers, offsets start at N
//! +---------------------------+
//! | central directory + EOCD  |
//! +---------------------------+
//! ```
//!
//! Which half of the program runs is decided once, at startup, by
//! [`detect_mode`].

pub mod builder;
pub mod extract;
pub mod runner;

pub use builder::{BuildReport, Builder};
pub use extract::Extractor;
pub use runner::{ScriptCommand, ScriptRunner};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::SfxError;
use crate::io::LocalFileReader;
use crate::zip::{ZipExtractor, ZipFileEntry};

/// Name of the entry that carries the script reference.
pub const SFX_KEY_NAME: &str = "~~~sfx~~~";

/// What an archive entry means to the self-extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// The script reference; never extracted to disk
    Metadata,
    Directory,
    File,
}

impl EntryKind {
    pub fn of(entry: &ZipFileEntry) -> Self {
        if entry.file_name == SFX_KEY_NAME {
            EntryKind::Metadata
        } else if entry.is_directory {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// How this invocation should behave, decided from the executable's bytes.
pub enum Mode {
    /// No payload: build a new archive from the command-line arguments
    Build,
    /// Payload present: unpack it and run the embedded script
    Extract(ZipExtractor<LocalFileReader>),
}

/// Inspect `exe` and decide between building and extracting.
///
/// Only a clean "no trailing index" result selects [`Mode::Build`]; failing
/// to read the executable is an error.
pub async fn detect_mode(exe: &Path) -> Result<Mode> {
    let reader = LocalFileReader::new(exe)
        .with_context(|| format!("cannot open executable {}", exe.display()))?;

    match ZipExtractor::open(Arc::new(reader)).await {
        Ok(archive) => {
            debug!("Payload entries: {}", archive.entries().len());
            Ok(Mode::Extract(archive))
        }
        Err(err) if matches!(err.downcast_ref::<SfxError>(), Some(SfxError::NotAnArchive(_))) => {
            debug!("No payload: {:#}", err);
            Ok(Mode::Build)
        }
        Err(err) => Err(err.context(format!("cannot inspect executable {}", exe.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::{EntryOptions, ZipWriter};
    use std::time::UNIX_EPOCH;

    #[tokio::test]
    async fn test_plain_file_is_build_mode() {
        let temp_dir = tempfile::tempdir().unwrap();
        let exe = temp_dir.path().join("plain");
        std::fs::write(&exe, b"\x7fELF not really an executable").unwrap();

        assert!(matches!(detect_mode(&exe).await.unwrap(), Mode::Build));
    }

    #[tokio::test]
    async fn test_payload_is_extract_mode() {
        let temp_dir = tempfile::tempdir().unwrap();
        let exe = temp_dir.path().join("packed");

        let prefix = b"\x7fELF stub".to_vec();
        let mut writer = ZipWriter::new(prefix.clone());
        writer.set_offset(prefix.len() as u64).unwrap();
        writer
            .add_file(SFX_KEY_NAME, &EntryOptions::new(0o644, UNIX_EPOCH), &mut &b"run.sh"[..])
            .unwrap();
        std::fs::write(&exe, writer.finish().unwrap()).unwrap();

        match detect_mode(&exe).await.unwrap() {
            Mode::Extract(archive) => {
                assert_eq!(archive.entries().len(), 1);
                assert_eq!(EntryKind::of(&archive.entries()[0]), EntryKind::Metadata);
            }
            Mode::Build => panic!("expected extract mode"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = detect_mode(&temp_dir.path().join("gone")).await.err().unwrap();
        assert!(err.downcast_ref::<SfxError>().is_none());
    }
}
