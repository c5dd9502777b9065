//! Persisted bearer token at `<home>/.border0/token`.
//!
//! When the process runs under `sudo`, the home directory of `SUDO_USER` is
//! used instead of root's so that the token lands where the invoking user
//! will look for it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ApiError, Result};

/// Directory under the home directory holding SDK state.
pub const TOKEN_DIR: &str = ".border0";
/// File name of the persisted token.
pub const TOKEN_FILE: &str = "token";

/// The home directory the token file belongs under.
#[must_use]
pub fn home_dir() -> Option<PathBuf> {
    if let Some(user) = std::env::var("SUDO_USER").ok().filter(|u| !u.is_empty()) {
        if let Some(home) = sudo_user_home(&user) {
            return Some(home);
        }
    }
    dirs::home_dir()
}

#[cfg(target_os = "macos")]
fn sudo_user_home(user: &str) -> Option<PathBuf> {
    Some(PathBuf::from("/Users").join(user))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn sudo_user_home(user: &str) -> Option<PathBuf> {
    let passwd = fs::read_to_string("/etc/passwd").ok()?;
    passwd_home(&passwd, user)
}

#[cfg(not(unix))]
fn sudo_user_home(_user: &str) -> Option<PathBuf> {
    None
}

/// Find a user's home directory in `/etc/passwd`-formatted text.
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn passwd_home(passwd: &str, user: &str) -> Option<PathBuf> {
    passwd
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 6 && fields[0] == user)
        .map(|fields| PathBuf::from(fields[5]))
}

/// Default token file location.
#[must_use]
pub fn token_path() -> Option<PathBuf> {
    home_dir().map(|home| token_path_in(&home))
}

/// Token file location under an explicit home directory.
#[must_use]
pub fn token_path_in(home: &Path) -> PathBuf {
    home.join(TOKEN_DIR).join(TOKEN_FILE)
}

/// Write `token` to the default location.
///
/// # Errors
///
/// Returns an error if no home directory can be determined or the write fails.
pub fn save_token(token: &str) -> Result<PathBuf> {
    let home = home_dir()
        .ok_or_else(|| ApiError::Config("cannot determine home directory".to_string()))?;
    save_token_in(&home, token)
}

/// Write `token` under `home`, creating the directory with mode 0750 and the
/// file with mode 0600.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save_token_in(home: &Path, token: &str) -> Result<PathBuf> {
    let path = token_path_in(home);
    let dir = home.join(TOKEN_DIR);

    create_private_dir(&dir)?;
    let mut file = open_private_file(&path)?;
    file.write_all(token.as_bytes())?;
    file.sync_all()?;

    debug!(path = %path.display(), "Saved token");
    Ok(path)
}

/// Read the token from the default location, if present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn load_token() -> Result<Option<String>> {
    match home_dir() {
        Some(home) => load_token_from(&home),
        None => Ok(None),
    }
}

/// Read the token stored under `home`, if present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn load_token_from(home: &Path) -> Result<Option<String>> {
    let path = token_path_in(home);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let token = contents.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o750)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn open_private_file(path: &Path) -> Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private_file(path: &Path) -> Result<fs::File> {
    Ok(fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}
