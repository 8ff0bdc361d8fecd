//! # sfx
//!
//! A self-extracting archive packer and runner.
//!
//! The `sfx` binary decides what to do by looking at its own bytes. A plain
//! build of the binary is a *builder*: given a target path, a directory and
//! an entry script, it writes a copy of itself followed by a ZIP archive of
//! the directory. The resulting file is a *runner*: when started, it finds
//! the archive behind its own executable code, unpacks it into a fresh
//! temporary directory, runs the script with `bash` (or `cmd.exe /c` on
//! Windows) and removes the directory again.
//!
//! ## Features
//!
//! - ZIP payloads with absolute offsets, readable by ordinary unzip tools
//! - STORED and DEFLATE entries, ZIP64 for large trees
//! - Unix permission bits and 1-second modification times preserved
//! - No partial output: failed builds leave no target file, and runs always
//!   remove their scratch directory
//!
//! ## Example
//!
//! ```no_run
//! use sfx::{Builder, Extractor, ZipExtractor};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Pack ./app behind a copy of the current executable
//!     let exe = std::env::current_exe()?;
//!     Builder::new(exe, "app.sfx", "app", "run.sh").build()?;
//!
//!     // Unpack and run it with two script arguments
//!     let archive = ZipExtractor::open_path(Path::new("app.sfx")).await?;
//!     Extractor::new(archive)
//!         .run(&["--port".to_string(), "8080".to_string()])
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod sfx;
pub mod zip;

pub use cli::{BuildArgs, Cli};
pub use error::SfxError;
pub use io::{LocalFileReader, MemoryReader, ReadAt};
pub use sfx::{
    BuildReport, Builder, EntryKind, Extractor, Mode, SFX_KEY_NAME, ScriptCommand, ScriptRunner,
    detect_mode,
};
pub use zip::{EntryOptions, ZipExtractor, ZipFileEntry, ZipWriter};
