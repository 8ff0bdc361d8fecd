//! Named failures that callers need to tell apart.
//!
//! Everything else travels as a plain [`anyhow::Error`]; these variants are
//! raised with `bail!`/`Err(..)?` and recovered with `downcast_ref`.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Errors raised while building, opening or running a self-extracting archive.
#[derive(Debug, Error)]
pub enum SfxError {
    /// Required build arguments were missing.
    #[error("Usage: {exe} <target> <dir> <script>")]
    Usage {
        /// Name the binary was invoked as.
        exe: String,
    },

    /// The file carries no trailing zip index.
    #[error("Not a valid ZIP file: {0}")]
    NotAnArchive(String),

    /// An entry's stored data does not match its central directory record.
    #[error("Corrupt entry {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Unsupported compression method: {0}")]
    UnsupportedCompression(u16),

    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("Invalid entry name: {0:?}")]
    InvalidEntryName(String),

    /// A path under the source directory collides with the metadata entry.
    #[error("Reserved name in source directory: {}", .0.display())]
    ReservedName(PathBuf),

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    /// The archive has no metadata entry naming the script to run.
    #[error("Script reference missing from archive")]
    MissingScriptReference,

    /// An entry name would escape the extraction directory.
    #[error("Unsafe entry name: {0}")]
    UnsafeEntryName(String),

    #[error("Target is the running executable: {}", .0.display())]
    TargetIsSource(PathBuf),

    #[error("Failed to launch {program}")]
    ScriptLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Script {script} failed: {status}")]
    ScriptFailed { script: String, status: ExitStatus },
}
