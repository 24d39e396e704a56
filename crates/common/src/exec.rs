//! Child process helpers
//!
//! Thin wrappers over `std::process::Command` used wherever the system shells
//! out to `wg`, `ip`, `iptables` or `sysctl`.

use crate::{Error, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Run a command, returning captured stdout. Non-zero exit is an error.
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    debug!("exec: {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::CommandFailed(format!(
            "{} {}: {} [{}]",
            program,
            args.join(" "),
            stderr.trim(),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command, ignoring its exit status. Returns whether it succeeded.
pub fn run_unchecked(program: &str, args: &[&str]) -> bool {
    debug!("exec (unchecked): {} {}", program, args.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Write a file with mode 0600, creating parent directories as needed
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Atomically replace a file: write to a sibling temp file, then rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent directory: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let out = run("echo", &["hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_propagates_failure() {
        assert!(run("false", &[]).is_err());
        assert!(!run_unchecked("false", &[]));
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.local");
        write_atomic(&path, b"10.1.0.0/24\n").unwrap();
        write_atomic(&path, b"10.2.0.0/24\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.2.0.0/24\n");
    }
}
