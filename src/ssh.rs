//! SSH key lookup and host key scanning.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::command::{CommandError, CommandRunner};

/// Errors raised by the SSH helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when a named key is not present.
    #[error("can't find ssh key named {name} (looked for {path})")]
    KeyNotFound {
        /// Key name as requested.
        name: String,
        /// Path that was checked.
        path: Utf8PathBuf,
    },
    /// Raised when a key file cannot be read.
    #[error("failed to read ssh key {path}: {message}")]
    KeyUnreadable {
        /// Key path.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when `ssh-keyscan` fails or returns nothing.
    #[error("failed to scan ssh host key of {host}: {message}")]
    HostKeyScan {
        /// Host that was scanned.
        host: String,
        /// Description of the failure.
        message: String,
    },
    /// Raised when a helper command cannot run.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Resolves a key name to an existing file.
///
/// Absolute paths and names starting with `./` are used as given. Any other
/// name is looked up under `~/.ssh`.
///
/// # Errors
///
/// Returns [`SshError::KeyNotFound`] when no file exists at the resolved path.
pub fn find_ssh_key(name: &str) -> Result<Utf8PathBuf, SshError> {
    let candidate = Utf8Path::new(name);
    let path = if candidate.is_absolute() || name.starts_with("./") {
        candidate.to_path_buf()
    } else {
        Utf8PathBuf::from(expand_tilde(&format!("~/.ssh/{name}")))
    };

    if file_exists(&path) {
        Ok(path)
    } else {
        Err(SshError::KeyNotFound {
            name: name.to_owned(),
            path,
        })
    }
}

/// Reads a public key file, trimming the trailing newline.
///
/// # Errors
///
/// Returns [`SshError::KeyUnreadable`] when the file cannot be read.
pub fn read_public_key(path: &Utf8Path) -> Result<String, SshError> {
    let unreadable = |message: String| SshError::KeyUnreadable {
        path: path.to_path_buf(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| unreadable(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| unreadable(err.to_string()))?;
    let contents = dir
        .read_to_string(file_name)
        .map_err(|err| unreadable(err.to_string()))?;
    Ok(contents.trim_end().to_owned())
}

/// Scans the public host key of `host` with `ssh-keyscan`.
///
/// # Errors
///
/// Returns [`SshError::HostKeyScan`] when the scan fails or yields no key.
pub fn scan_host_key(
    runner: &impl CommandRunner,
    keyscan_bin: &str,
    host: &str,
) -> Result<String, SshError> {
    let output = runner.run(keyscan_bin, &[OsString::from(host)])?;
    if !output.is_success() {
        return Err(SshError::HostKeyScan {
            host: host.to_owned(),
            message: CommandError::failure(keyscan_bin, &output).to_string(),
        });
    }

    let key = output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("\n");
    if key.is_empty() {
        return Err(SshError::HostKeyScan {
            host: host.to_owned(),
            message: String::from("no host key returned"),
        });
    }
    Ok(key)
}

fn file_exists(path: &Utf8Path) -> bool {
    let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
        return false;
    };
    Dir::open_ambient_dir(parent, ambient_authority())
        .and_then(|dir| dir.try_exists(file_name))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    use crate::test_support::{EnvGuard, ScriptedRunner};

    #[rstest]
    fn absolute_paths_are_used_verbatim() {
        let tmp = TempDir::new().expect("tempdir");
        let key = Utf8PathBuf::from_path_buf(tmp.path().join("id_covey")).expect("utf8 path");
        std::fs::write(&key, "private").expect("write key");

        assert_eq!(find_ssh_key(key.as_str()).expect("key exists"), key);
    }

    #[rstest]
    #[case("/nonexistent-covey-keys/id_covey")]
    #[case("./nonexistent-covey-keys/id_covey")]
    fn missing_explicit_paths_are_not_found(#[case] name: &str) {
        let err = find_ssh_key(name).expect_err("no such key");

        assert_eq!(
            err,
            SshError::KeyNotFound {
                name: name.to_owned(),
                path: Utf8PathBuf::from(name),
            }
        );
    }

    #[tokio::test]
    async fn bare_names_resolve_under_home_ssh() {
        let tmp = TempDir::new().expect("tempdir");
        let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 path");
        std::fs::create_dir_all(home.join(".ssh")).expect("create .ssh");
        std::fs::write(home.join(".ssh/id_covey"), "private").expect("write key");
        let _guard = EnvGuard::set_vars(&[("HOME", home.as_str())]).await;

        assert_eq!(
            find_ssh_key("id_covey").expect("key exists"),
            home.join(".ssh/id_covey")
        );
        assert!(matches!(
            find_ssh_key("id_missing"),
            Err(SshError::KeyNotFound { .. })
        ));
    }

    #[rstest]
    fn host_key_scan_drops_comments() {
        let runner = ScriptedRunner::new();
        runner.push_stdout("# 172.28.0.2:22 SSH-2.0-OpenSSH\n172.28.0.2 ssh-ed25519 AAAA\n");

        let key = scan_host_key(&runner, "ssh-keyscan", "172.28.0.2").expect("scan");

        assert_eq!(key, "172.28.0.2 ssh-ed25519 AAAA");
        let invocations = runner.invocations();
        assert_eq!(
            invocations.first().map(|call| call.command_string()),
            Some(String::from("ssh-keyscan 172.28.0.2"))
        );
    }

    #[rstest]
    fn empty_scan_is_an_error() {
        let runner = ScriptedRunner::new();
        runner.push_stdout("# nothing here\n");

        let err = scan_host_key(&runner, "ssh-keyscan", "10.0.0.1").expect_err("no key");

        assert!(matches!(err, SshError::HostKeyScan { .. }));
    }
}
