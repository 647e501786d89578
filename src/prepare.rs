/// Filesystem preparation before the server starts: the database directory
/// and an empty database file must exist.
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// What `ensure_database_file` had to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub created_dir: bool,
    pub created_file: bool,
}

/// Errors that abort startup before the server is spawned.
#[derive(Debug)]
pub enum PrepareError {
    /// Failed to create the database directory (or an ancestor).
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to create the empty database file.
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::CreateDir { path, source } => {
                write!(
                    f,
                    "failed to create database directory {}: {}",
                    path.display(),
                    source
                )
            }
            PrepareError::CreateFile { path, source } => {
                write!(
                    f,
                    "failed to create database file {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for PrepareError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PrepareError::CreateDir { source, .. } => Some(source),
            PrepareError::CreateFile { source, .. } => Some(source),
        }
    }
}

/// Make sure `db_path`'s parent directory and the file itself exist.
///
/// Missing ancestors are created. An existing file is never opened for
/// truncation, so its content is left untouched.
pub fn ensure_database_file(db_path: &Path) -> Result<Prepared, PrepareError> {
    let mut prepared = Prepared {
        created_dir: false,
        created_file: false,
    };

    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            tracing::info!(path = %dir.display(), "creating database directory");
            std::fs::create_dir_all(dir).map_err(|e| PrepareError::CreateDir {
                path: dir.to_path_buf(),
                source: e,
            })?;
            prepared.created_dir = true;
        }
    }

    if !db_path.exists() {
        tracing::info!(path = %db_path.display(), "creating database file");
        match OpenOptions::new().write(true).create_new(true).open(db_path) {
            Ok(_) => prepared.created_file = true,
            // Someone else created it between the check and the open
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(PrepareError::CreateFile {
                    path: db_path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok(prepared)
}
