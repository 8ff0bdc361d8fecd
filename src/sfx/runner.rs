//! Launching the embedded script through the host's command interpreter.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Result, bail};
use tokio::process::Command;

use crate::error::SfxError;

/// Interpreter used to run the entry script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptRunner {
    /// `bash <script> args...`
    Bash,
    /// `cmd.exe /c <script> args...`
    WindowsShell,
}

impl ScriptRunner {
    /// The interpreter for the platform this binary was built for
    pub fn host() -> Self {
        if cfg!(windows) {
            ScriptRunner::WindowsShell
        } else {
            ScriptRunner::Bash
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            ScriptRunner::Bash => "bash",
            ScriptRunner::WindowsShell => "cmd.exe",
        }
    }

    /// Interpreter arguments that precede the script path
    fn leading_args(&self) -> &'static [&'static str] {
        match self {
            ScriptRunner::Bash => &[],
            ScriptRunner::WindowsShell => &["/c"],
        }
    }

    /// Describe the process that runs `script` inside `workdir`, with
    /// `args` appended after the script path unchanged.
    pub fn command(&self, script: &str, args: &[String], workdir: &Path) -> ScriptCommand {
        let mut argv: Vec<String> = self.leading_args().iter().map(|s| s.to_string()).collect();
        argv.push(script.to_string());
        argv.extend(args.iter().cloned());

        ScriptCommand {
            program: self.program().to_string(),
            script: script.to_string(),
            args: argv,
            current_dir: workdir.to_path_buf(),
        }
    }
}

/// A ready-to-launch script invocation.
///
/// Standard output (and standard error) are shared with this process;
/// standard input is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub program: String,
    /// Script path as recorded in the archive
    pub script: String,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
}

impl ScriptCommand {
    /// Run the command to completion. There is no timeout.
    pub async fn run(&self) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SfxError::ScriptLaunch {
                program: self.program.clone(),
                source,
            })?;

        let status = child.wait().await?;
        if !status.success() {
            bail!(SfxError::ScriptFailed {
                script: self.script.clone(),
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bash_command() {
        let cmd = ScriptRunner::Bash.command("bin/run.sh", &args(&["-x", "two words"]), Path::new("/tmp/x"));
        assert_eq!(cmd.program, "bash");
        assert_eq!(cmd.args, args(&["bin/run.sh", "-x", "two words"]));
        assert_eq!(cmd.current_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_windows_command() {
        let cmd = ScriptRunner::WindowsShell.command("run.cmd", &args(&["a"]), Path::new("C:\\t"));
        assert_eq!(cmd.program, "cmd.exe");
        assert_eq!(cmd.args, args(&["/c", "run.cmd", "a"]));
    }

    #[test]
    fn test_host_runner() {
        #[cfg(windows)]
        assert_eq!(ScriptRunner::host(), ScriptRunner::WindowsShell);
        #[cfg(not(windows))]
        assert_eq!(ScriptRunner::host(), ScriptRunner::Bash);
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cmd = ScriptCommand {
            program: "sfx-no-such-interpreter".to_string(),
            script: "run.sh".to_string(),
            args: args(&["run.sh"]),
            current_dir: temp_dir.path().to_path_buf(),
        };
        let err = cmd.run().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SfxError>(),
            Some(SfxError::ScriptLaunch { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("fail.sh"), "exit 3\n").unwrap();

        let cmd = ScriptRunner::Bash.command("fail.sh", &[], temp_dir.path());
        let err = cmd.run().await.unwrap_err();
        match err.downcast_ref::<SfxError>() {
            Some(SfxError::ScriptFailed { script, status }) => {
                assert_eq!(script, "fail.sh");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
