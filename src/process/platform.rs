//! Platform specifics: where the deployed executable lives and how it is killed.
//!
//! | Target  | Executable (relative to workspace)         | Killed with                       |
//! |---------|--------------------------------------------|-----------------------------------|
//! | Windows | `<app>.exe`                                | `taskkill /F /IM <app>.exe`       |
//! | macOS   | `<app>.app/Contents/MacOS/<app>`           | `pkill -KILL -f '^<exe>( \|$)'`   |
//! | other   | `<app>`                                    | `pkill -KILL -f '^<exe>( \|$)'`   |
//!
//! On Unix the whole command line is matched, since Linux truncates process
//! names to 15 characters. The pattern is anchored on the absolute path the
//! agent spawned, so processes that merely mention the name survive.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::debug;

use super::{ProcessControl, StopError};

/// Executable path for `app_name`, relative to the workspace root.
pub fn executable_path(app_name: &str) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(format!("{app_name}.exe"))
    } else if cfg!(target_os = "macos") {
        PathBuf::from(format!("{app_name}.app"))
            .join("Contents")
            .join("MacOS")
            .join(app_name)
    } else {
        PathBuf::from(app_name)
    }
}

/// Name the forced kill looks for.
pub fn process_name(app_name: &str) -> String {
    if cfg!(windows) {
        format!("{app_name}.exe")
    } else {
        app_name.to_string()
    }
}

/// Command line that force-kills the application started from `executable`.
pub fn kill_command(name: &str, executable: &Path) -> (&'static str, Vec<String>) {
    if cfg!(windows) {
        (
            "taskkill",
            vec!["/F".into(), "/IM".into(), name.to_string()],
        )
    } else {
        (
            "pkill",
            vec![
                "-KILL".into(),
                "-f".into(),
                "--".into(),
                command_line_pattern(executable),
            ],
        )
    }
}

/// Extended regex matching a command line whose first word is `executable`.
pub fn command_line_pattern(executable: &Path) -> String {
    let mut pattern = String::from("^");
    for c in executable.to_string_lossy().chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("( |$)");
    pattern
}

/// Map the terminator's exit status.
///
/// `taskkill` fails for any reason when the image is gone. `pkill` exits 1
/// when nothing matched; 2 and 3 are usage and fatal errors.
fn stop_result(name: &str, status: ExitStatus, stderr: &[u8]) -> Result<(), StopError> {
    if status.success() {
        return Ok(());
    }
    let detail = format!("{status}: {}", String::from_utf8_lossy(stderr).trim());
    if cfg!(windows) || status.code() == Some(1) {
        Err(StopError::AlreadyExited {
            name: name.to_string(),
            detail,
        })
    } else {
        Err(StopError::Failed {
            name: name.to_string(),
            source: io::Error::other(detail),
        })
    }
}

/// Files written by the `file` verb carry default permissions; add the
/// execute bits before spawning. A missing file is left for the spawn to report.
#[cfg(unix)]
pub async fn ensure_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut perms = metadata.permissions();
    let mode = perms.mode();
    if mode & 0o111 != 0o111 {
        perms.set_mode(mode | 0o111);
        tokio::fs::set_permissions(path, perms).await?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn ensure_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// [`ProcessControl`] backed by real OS processes.
#[derive(Debug, Default)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    /// Kept only so the child is reaped once it exits. Dropping it does not
    /// kill the application.
    type Handle = Child;

    fn spawn(&mut self, executable: &Path, working_dir: &Path) -> io::Result<Child> {
        Command::new(executable)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .spawn()
    }

    async fn force_stop(&mut self, name: &str, executable: &Path) -> Result<(), StopError> {
        let (program, args) = kill_command(name, executable);
        let failed = |source| StopError::Failed {
            name: name.to_string(),
            source,
        };
        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(failed)?;
        debug!(
            program,
            status = %output.status,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Terminator finished"
        );
        stop_result(name, output.status, &output.stderr)
    }
}
