//! Pid files.
//!
//! A pid file holds the decimal pid of the process that owns it followed by a newline. It is
//! written to a temporary sibling first and renamed into place, so readers never see a partial
//! file.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use reaper_posix::{Pid, identity, process};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("'{}' belongs to running process {pid}", .path.display())]
    InUse { path: PathBuf, pid: i32 },
    #[error("directory '{}' is not writable", .0.display())]
    NotWritable(PathBuf),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

/// Reads the pid stored at `path`.
///
/// Returns `None` when the file doesn't exist or doesn't hold a positive pid.
///
/// # Errors
///
/// * If the file exists but couldn't be read
pub fn read_pid(path: &Path) -> Result<Option<i32>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    Ok(contents.trim().parse::<i32>().ok().filter(|x| *x > 0))
}

/// A pid file naming the current process, removed again on drop if it still does.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
}

impl PidFile {
    /// Writes the current pid to `path`.
    ///
    /// A file left behind by a process that no longer runs is replaced.
    ///
    /// # Errors
    ///
    /// * [`PidFileError::InUse`] if `path` names another running process
    /// * [`PidFileError::NotWritable`] if the containing directory can't be written
    /// * If writing or renaming the file failed
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let pid = identity::get_pid();

        let dir = match path.parent() {
            Some(x) if !x.as_os_str().is_empty() => x,
            _ => Path::new("."),
        };
        if !process::is_writable(dir) {
            return Err(PidFileError::NotWritable(dir.to_path_buf()));
        }

        if let Some(existing) = read_pid(&path)? {
            if existing != pid && process::is_alive(Pid::from_raw(existing)) {
                return Err(PidFileError::InUse {
                    path,
                    pid: existing,
                });
            }
            log::warn!(
                "create: replacing stale pid file '{}' pid={existing}",
                path.display()
            );
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{pid}.tmp"));
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, format!("{pid}\n"))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        log::debug!("create: wrote '{}' pid={pid}", path.display());

        Ok(Self { path, pid })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    log::warn!("drop: couldn't remove '{}': {e}", self.path.display());
                }
            }
            Ok(_) => log::debug!(
                "drop: '{}' no longer names pid={}, leaving it",
                self.path.display(),
                self.pid
            ),
            Err(e) => log::warn!("drop: {e}"),
        }
    }
}
