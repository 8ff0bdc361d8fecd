//! Unpacking a payload into a scratch directory and running its script.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, warn};

use super::runner::ScriptRunner;
use super::EntryKind;
use crate::error::SfxError;
use crate::io::ReadAt;
use crate::zip::ZipExtractor;

/// Runs the script embedded in an opened self-extracting archive.
pub struct Extractor<R: ReadAt> {
    archive: ZipExtractor<R>,
    scratch_root: Option<PathBuf>,
    runner: ScriptRunner,
}

impl<R: ReadAt> Extractor<R> {
    pub fn new(archive: ZipExtractor<R>) -> Self {
        Self {
            archive,
            scratch_root: None,
            runner: ScriptRunner::host(),
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_runner(mut self, runner: ScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Unpack every entry except the metadata entry into `dest` and return
    /// the script reference.
    ///
    /// Directories stay owner-writable until every entry is written; their
    /// recorded modes are applied last, deepest first.
    pub async fn unpack(&self, dest: &Path) -> Result<String> {
        let mut script = None;
        let mut directories = Vec::new();

        for entry in self.archive.entries() {
            match EntryKind::of(entry) {
                EntryKind::Metadata => {
                    let data = self.archive.extract_to_memory(entry).await?;
                    let reference = String::from_utf8(data).map_err(|_| SfxError::Corrupt {
                        name: entry.file_name.clone(),
                        reason: "script reference is not UTF-8".to_string(),
                    })?;
                    script = Some(reference);
                }
                EntryKind::Directory => {
                    debug!("Extracting: {} (dir)", entry.file_name);
                    let path = dest.join(entry_path(&entry.file_name)?);
                    create_dir(&path, entry.permissions())
                        .await
                        .with_context(|| format!("cannot extract {}", entry.file_name))?;
                    directories.push((path, entry.permissions()));
                }
                EntryKind::File => {
                    debug!("Extracting: {} size {}", entry.file_name, entry.uncompressed_size);
                    let path = dest.join(entry_path(&entry.file_name)?);
                    self.archive
                        .extract_to_file(entry, &path, entry.permissions(), entry.modified())
                        .await
                        .with_context(|| format!("cannot extract {}", entry.file_name))?;
                }
            }
        }

        directories.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, permissions) in directories {
            set_dir_permissions(&path, permissions)
                .await
                .with_context(|| format!("cannot set permissions on {}", path.display()))?;
        }

        match script {
            Some(script) => Ok(script),
            None => bail!(SfxError::MissingScriptReference),
        }
    }

    /// Unpack into a fresh scratch directory, run the script there with
    /// `args`, and remove the directory whatever the outcome.
    pub async fn run(&self, args: &[String]) -> Result<()> {
        let scratch = ScratchDir::create(self.scratch_root.as_deref())?;
        info!("Extracting to temp dir: {}", scratch.path().display());

        let result = self.unpack_and_run(scratch.path(), args).await;
        scratch.remove();
        result?;

        info!("done.");
        Ok(())
    }

    async fn unpack_and_run(&self, dir: &Path, args: &[String]) -> Result<()> {
        let script = self.unpack(dir).await?;
        info!("Script: {} {:?}", script, args);
        self.runner.command(&script, args, dir).run().await
    }
}

/// Exclusively owned extraction directory.
///
/// Removed by [`ScratchDir::remove`] on the normal path; the inner
/// [`TempDir`] removes it on drop if an early return or panic skips that.
struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sfx-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn remove(self) {
        info!("Removing temp dir: {}", self.path().display());
        make_removable(self.path());
        let path = self.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!("Failed to remove temp dir {}: {}", path.display(), err);
        }
    }
}

/// Grant the owner write access to every directory so entries extracted
/// with read-only directory modes can still be deleted.
#[cfg(unix)]
fn make_removable(root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            let mode = metadata.permissions().mode();
            if mode & 0o700 != 0o700 {
                let _ = std::fs::set_permissions(
                    entry.path(),
                    std::fs::Permissions::from_mode(mode | 0o700),
                );
            }
        }
    }
}

#[cfg(not(unix))]
fn make_removable(_root: &Path) {}

/// Create `path` writable by its owner; the recorded mode is applied later
/// by [`set_dir_permissions`].
async fn create_dir(path: &Path, permissions: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(permissions | 0o700);
    builder.create(path).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path).await?.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode | 0o700)).await?;
        }
    }
    #[cfg(not(unix))]
    let _ = permissions;

    Ok(())
}

#[cfg(unix)]
async fn set_dir_permissions(path: &Path, permissions: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(permissions)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_dir_permissions(_path: &Path, _permissions: u32) -> Result<()> {
    Ok(())
}

/// Map a `/`-separated entry name to a relative path that cannot leave the
/// extraction directory.
fn entry_path(name: &str) -> Result<PathBuf> {
    if name.starts_with('/') {
        bail!(SfxError::UnsafeEntryName(name.to_string()));
    }

    let mut path = PathBuf::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => bail!(SfxError::UnsafeEntryName(name.to_string())),
            _ => {
                let mut components = Path::new(part).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(component)), None) => path.push(component),
                    _ => bail!(SfxError::UnsafeEntryName(name.to_string())),
                }
            }
        }
    }

    if path.as_os_str().is_empty() {
        bail!(SfxError::UnsafeEntryName(name.to_string()));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::sfx::SFX_KEY_NAME;
    use crate::zip::{EntryOptions, ZipWriter};
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    async fn archive(entries: &[(&str, &str)]) -> ZipExtractor<MemoryReader> {
        let mut writer = ZipWriter::new(Vec::new());
        for (name, content) in entries {
            let options = EntryOptions::new(0o644, UNIX_EPOCH);
            if let Some(dir) = name.strip_suffix('/') {
                writer.add_directory(dir, &options).unwrap();
            } else {
                writer.add_file(name, &options, &mut content.as_bytes()).unwrap();
            }
        }
        ZipExtractor::open(Arc::new(MemoryReader::new(writer.finish().unwrap())))
            .await
            .unwrap()
    }

    #[test]
    fn test_entry_path() {
        assert_eq!(entry_path("a/b.txt").unwrap(), Path::new("a").join("b.txt"));
        assert_eq!(entry_path("./a//b/").unwrap(), Path::new("a").join("b"));
        assert!(entry_path("../escape").is_err());
        assert!(entry_path("a/../../escape").is_err());
        assert!(entry_path("/etc/passwd").is_err());
        assert!(entry_path("./").is_err());
    }

    #[tokio::test]
    async fn test_unpack_skips_metadata() {
        let temp_dir = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(
            archive(&[(SFX_KEY_NAME, "bin/run.sh"), ("bin/", ""), ("bin/run.sh", "echo hi\n")]).await,
        );

        let script = extractor.unpack(temp_dir.path()).await.unwrap();
        assert_eq!(script, "bin/run.sh");
        assert_eq!(
            std::fs::read(temp_dir.path().join("bin/run.sh")).unwrap(),
            b"echo hi\n"
        );
        assert!(!temp_dir.path().join(SFX_KEY_NAME).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_mode_applied_after_children() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(
            archive(&[
                (SFX_KEY_NAME, "run.sh"),
                ("outer/", ""),
                ("outer/inner/", ""),
                ("outer/inner/data.txt", "x"),
            ])
            .await,
        );
        extractor.unpack(temp_dir.path()).await.unwrap();

        // archive() records 0o644 for directories too, so each level has to be
        // opened up again before the next one can be inspected
        for dir in ["outer", "outer/inner"] {
            let path = temp_dir.path().join(dir);
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        assert_eq!(std::fs::read(temp_dir.path().join("outer/inner/data.txt")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_missing_script_reference() {
        let temp_dir = tempfile::tempdir().unwrap();
        let extractor = Extractor::new(archive(&[("run.sh", "exit 0\n")]).await);

        let err = extractor.unpack(temp_dir.path()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SfxError>(),
            Some(SfxError::MissingScriptReference)
        ));
    }

    #[tokio::test]
    async fn test_write_failure_names_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join("run.sh")).unwrap();
        let extractor =
            Extractor::new(archive(&[(SFX_KEY_NAME, "run.sh"), ("run.sh", "exit 0\n")]).await);

        let err = extractor.unpack(temp_dir.path()).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot extract run.sh");
    }

    #[tokio::test]
    async fn test_unsafe_entry_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let extractor = Extractor::new(
            archive(&[(SFX_KEY_NAME, "run.sh"), ("../outside.txt", "nope")]).await,
        );

        let err = extractor.unpack(&dest).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SfxError>(),
            Some(SfxError::UnsafeEntryName(_))
        ));
        assert!(!temp_dir.path().join("outside.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directory_is_cleaned_up() {
        let scratch_root = tempfile::tempdir().unwrap();
        let mut writer = ZipWriter::new(Vec::new());
        writer
            .add_file(SFX_KEY_NAME, &EntryOptions::new(0o644, UNIX_EPOCH), &mut &b"run.sh"[..])
            .unwrap();
        writer
            .add_file("run.sh", &EntryOptions::new(0o644, UNIX_EPOCH), &mut &b"exit 0\n"[..])
            .unwrap();
        writer
            .add_directory("locked", &EntryOptions::new(0o555, UNIX_EPOCH))
            .unwrap();
        writer
            .add_file("locked/data.txt", &EntryOptions::new(0o444, UNIX_EPOCH), &mut &b"x"[..])
            .unwrap();
        let archive = ZipExtractor::open(Arc::new(MemoryReader::new(writer.finish().unwrap())))
            .await
            .unwrap();

        Extractor::new(archive)
            .with_scratch_root(scratch_root.path())
            .run(&[])
            .await
            .unwrap();

        assert_eq!(std::fs::read_dir(scratch_root.path()).unwrap().count(), 0);
    }
}
