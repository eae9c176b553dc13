//! Locating and running the mtr-packet helper.

use std::env;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::error::HelperError;

pub use crate::probe::parse_ip;

/// Name of the helper binary looked up on `$PATH`
pub const HELPER_BINARY: &str = "mtr-packet";

/// Find an executable called `name` on `$PATH`
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_in(name, &path)
}

/// Find an executable called `name` in a `$PATH`-style directory list
pub fn find_in(name: &str, path: &OsStr) -> Option<PathBuf> {
    env::split_paths(path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A running helper with piped stdio
///
/// The child is killed when this is dropped.
#[derive(Debug)]
pub struct HelperProcess {
    child: Child,
    path: PathBuf,
}

impl HelperProcess {
    pub fn spawn(path: &Path) -> Result<Self, HelperError> {
        let child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HelperError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Spawned helper {} (pid {:?})", path.display(), child.id());
        Ok(Self {
            child,
            path: path.to_path_buf(),
        })
    }

    /// Take the child's stdin, stdout and stderr; only succeeds once
    pub fn take_pipes(&mut self) -> Result<(ChildStdin, ChildStdout, ChildStderr), HelperError> {
        let stdin = self.child.stdin.take().ok_or(HelperError::MissingPipe("stdin"))?;
        let stdout = self.child.stdout.take().ok_or(HelperError::MissingPipe("stdout"))?;
        let stderr = self.child.stderr.take().ok_or(HelperError::MissingPipe("stderr"))?;
        Ok((stdin, stdout, stderr))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OS process id, None once the child has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_skips_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = env::join_paths([Path::new("/nonexistent/bin"), dir.path()]).unwrap();
        assert_eq!(find_in("mtr-packet", &path), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let plain = tempfile::tempdir().unwrap();
        let exec = tempfile::tempdir().unwrap();
        let not_exec = plain.path().join("mtr-packet");
        let binary = exec.path().join("mtr-packet");
        std::fs::write(&not_exec, b"").unwrap();
        std::fs::write(&binary, b"").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = env::join_paths([plain.path(), exec.path()]).unwrap();
        assert_eq!(find_in("mtr-packet", &path), Some(binary));
    }

    #[test]
    fn test_find_in_ignores_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("mtr-packet")).unwrap();
        assert_eq!(find_in("mtr-packet", dir.path().as_os_str()), None);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let err = HelperProcess::spawn(Path::new("/nonexistent/mtr-packet")).unwrap_err();
        assert!(matches!(err, HelperError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/mtr-packet"));
    }

    #[test]
    fn test_parse_ip_reexport() {
        assert!(parse_ip("::1").unwrap().is_ipv6());
        assert!(parse_ip("not-an-address").is_err());
    }
}
