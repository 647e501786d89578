/// Database path resolution: default location, drive-letter escaping and
/// lexical normalization against the working directory.
use regex::Regex;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static DRIVE_LETTER_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]:\\").unwrap());

/// Directory holding the running executable.
///
/// Falls back to the current working directory when the executable path
/// cannot be determined.
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default database location: `<install_dir>/<file_name>`.
pub fn default_db_path(install_dir: &Path, file_name: &str) -> PathBuf {
    install_dir.join(file_name)
}

/// Double every backslash in a `X:\...` path so it survives a shell layer.
/// Any other string is returned unchanged.
pub fn escape_windows_path(path: &str) -> Cow<'_, str> {
    if DRIVE_LETTER_PATH.is_match(path) {
        Cow::Owned(path.replace('\\', "\\\\"))
    } else {
        Cow::Borrowed(path)
    }
}

/// Resolve the database path the child will receive.
///
/// An absent or empty `raw` selects the default location. The result is
/// always absolute: relative input is joined onto `cwd`, then `.` and `..`
/// segments are folded lexically (symlinks are not consulted).
pub fn resolve_db_path(
    raw: Option<&str>,
    install_dir: &Path,
    default_file_name: &str,
    cwd: &Path,
) -> PathBuf {
    let chosen = match raw.filter(|s| !s.is_empty()) {
        Some(raw) => PathBuf::from(escape_windows_path(raw).as_ref()),
        None => default_db_path(install_dir, default_file_name),
    };
    let absolute = if chosen.is_absolute() {
        chosen
    } else {
        cwd.join(chosen)
    };
    normalize(&absolute)
}

/// Lexically fold `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(name) => out.push(name),
        }
    }
    out
}
