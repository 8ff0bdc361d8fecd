//! Building a self-extracting archive from a directory tree.

use std::fs::{self, File, Metadata, OpenOptions, Permissions};
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::SFX_KEY_NAME;
use crate::error::SfxError;
use crate::zip::{CompressionMethod, EntryOptions, ZipWriter};

/// Writes `[source executable][zip of dir]` to a target path.
///
/// The target either ends up as a complete archive or does not exist.
#[derive(Debug, Clone)]
pub struct Builder {
    source_exe: PathBuf,
    target: PathBuf,
    dir: PathBuf,
    script: String,
    method: CompressionMethod,
}

/// Summary of a finished build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    /// Length of the executable prefix, i.e. where the archive begins
    pub data_start: u64,
    /// Number of archive entries, including the script reference
    pub entries: usize,
    pub total_size: u64,
}

impl Builder {
    pub fn new(
        source_exe: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        dir: impl Into<PathBuf>,
        script: impl Into<String>,
    ) -> Self {
        Self {
            source_exe: source_exe.into(),
            target: target.into(),
            dir: dir.into(),
            script: script.into(),
            method: CompressionMethod::Deflate,
        }
    }

    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn build(&self) -> Result<BuildReport> {
        let script = normalize_script(&self.script)?;
        info!(
            "Creating: {} from {} script {}",
            self.target.display(),
            self.dir.display(),
            script
        );

        let mut exe = File::open(&self.source_exe)
            .with_context(|| format!("cannot open {}", self.source_exe.display()))?;
        let permissions = exe.metadata()?.permissions();

        if same_file(&self.source_exe, &self.target) {
            bail!(SfxError::TargetIsSource(self.target.clone()));
        }

        let file = create_target(&self.target, &permissions)?;
        let guard = IncompleteTarget { path: &self.target };

        // `file` is closed inside write_archive before the guard can act
        let report = self.write_archive(&mut exe, file, &script)?;
        fs::set_permissions(&self.target, permissions)?;
        guard.complete();

        info!("done.");
        Ok(report)
    }

    fn write_archive(&self, exe: &mut File, mut file: File, script: &str) -> Result<BuildReport> {
        let data_start = io::copy(exe, &mut file)?;
        debug!("Executable size: {}", data_start);

        let mut writer = ZipWriter::new(BufWriter::new(file));
        writer.set_offset(data_start)?;

        // Fixed timestamp so identical inputs give identical payloads
        let key_options = EntryOptions::new(0o644, UNIX_EPOCH).with_method(self.method);
        writer.add_file(SFX_KEY_NAME, &key_options, &mut script.as_bytes())?;

        let skip = self.target_inside_source();
        let mut entries = 1;
        let mut found = false;

        for item in WalkDir::new(&self.dir)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
        {
            let item = item?;
            let path = item.path();
            let name = entry_name(&self.dir, path)?;

            if name == SFX_KEY_NAME {
                bail!(SfxError::ReservedName(path.to_path_buf()));
            }
            if let Some(target) = &skip {
                if path.canonicalize().ok().as_ref() == Some(target) {
                    debug!("Skipping output file: {}", name);
                    continue;
                }
            }

            let metadata = item.metadata()?;
            let options =
                EntryOptions::new(permission_bits(&metadata), metadata.modified()?).with_method(self.method);

            if metadata.is_dir() {
                debug!("Adding: {}/", name);
                writer.add_directory(&name, &options)?;
            } else {
                let mut source =
                    File::open(path).with_context(|| format!("cannot read {}", path.display()))?;
                let size = writer.add_file(&name, &options, &mut source)?;
                debug!("Adding: {} size {}", name, size);
                found |= name == script;
            }
            entries += 1;
        }

        if !found {
            bail!(SfxError::ScriptNotFound(script.to_string()));
        }

        let file = writer
            .finish()?
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?;
        file.sync_all()?;

        Ok(BuildReport {
            data_start,
            entries,
            total_size: file.metadata()?.len(),
        })
    }

    /// Canonical target path, when the target lives under the source tree
    fn target_inside_source(&self) -> Option<PathBuf> {
        let target = self.target.canonicalize().ok()?;
        let dir = self.dir.canonicalize().ok()?;
        target.starts_with(&dir).then_some(target)
    }
}

/// Deletes the target on drop unless the build completed.
struct IncompleteTarget<'a> {
    path: &'a Path,
}

impl IncompleteTarget<'_> {
    fn complete(self) {
        std::mem::forget(self);
    }
}

impl Drop for IncompleteTarget<'_> {
    fn drop(&mut self) {
        info!("Removing incomplete file: {}", self.path.display());
        if let Err(err) = fs::remove_file(self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), err);
        }
    }
}

fn create_target(target: &Path, permissions: &Permissions) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(permissions.mode());
    }
    #[cfg(not(unix))]
    let _ = permissions;

    options
        .open(target)
        .with_context(|| format!("cannot create {}", target.display()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

/// Archive name of `path`: its components below `root`, joined with `/`.
fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root)?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => bail!(SfxError::InvalidEntryName(
                    relative.to_string_lossy().into_owned()
                )),
            },
            _ => bail!(SfxError::InvalidEntryName(
                relative.to_string_lossy().into_owned()
            )),
        }
    }
    Ok(parts.join("/"))
}

/// Bring a user-supplied script path into the form `entry_name` produces,
/// so `./run.sh` and `run.sh` name the same entry.
fn normalize_script(script: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in Path::new(script).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => bail!(SfxError::ScriptNotFound(script.to_string())),
            },
            _ => bail!(SfxError::ScriptNotFound(script.to_string())),
        }
    }
    if parts.is_empty() {
        bail!(SfxError::ScriptNotFound(script.to_string()));
    }
    Ok(parts.join("/"))
}
