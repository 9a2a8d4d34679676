//! Path sandbox: every user-supplied path resolves to an absolute path under
//! the configured base, with no traversal and no symlink component.
//!
//! `safe_sub_path` gives the lexical guarantee only; callers that re-validate
//! per entry (archive extraction) use it directly. `safe_path` adds the
//! symlink walk and is what request handlers use.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path escape detected")]
    EscapeDetected,

    #[error("path contains symlink")]
    ContainsSymlink,

    #[error("cannot resolve path")]
    Io(#[from] io::Error),
}

/// Resolve `user` beneath `base` with traversal and symlink protection.
pub fn safe_path(base: &Path, user: &str) -> Result<PathBuf, PathError> {
    let full = safe_sub_path(base, user)?;
    validate_no_symlink(base, &full)?;
    Ok(full)
}

/// Resolve `user` beneath `base` lexically: absolutise the base, append the
/// user path as a relative suffix, clean, and require containment.
pub fn safe_sub_path(base: &Path, user: &str) -> Result<PathBuf, PathError> {
    let clean_base = absolutize(base)?;

    let mut joined = clean_base.clone().into_os_string();
    joined.push("/");
    joined.push(user);
    let full = lexical_clean(Path::new(&joined));

    // A base of "/" contains every absolute path.
    if clean_base == Path::new("/") {
        return Ok(full);
    }

    if full != clean_base && !full.starts_with(&clean_base) {
        return Err(PathError::EscapeDetected);
    }

    Ok(full)
}

/// Walk the relative portion of `full` one segment at a time, rejecting any
/// existing intermediate that is a symlink. Missing intermediates are fine:
/// the path is being created.
pub fn validate_no_symlink(base: &Path, full: &Path) -> Result<(), PathError> {
    let clean_base = absolutize(base)?;
    let clean_full = lexical_clean(full);

    if clean_base != Path::new("/") && clean_full != clean_base && !clean_full.starts_with(&clean_base) {
        return Err(PathError::EscapeDetected);
    }

    let rel = match clean_full.strip_prefix(&clean_base) {
        Ok(rel) => rel,
        Err(_) => return Err(PathError::EscapeDetected),
    };

    let mut cur = clean_base;
    for segment in rel.components() {
        let Component::Normal(segment) = segment else {
            continue;
        };
        cur.push(segment);
        match std::fs::symlink_metadata(&cur) {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return Err(PathError::ContainsSymlink);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(PathError::Io(err)),
        }
    }

    Ok(())
}

fn absolutize(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        Ok(lexical_clean(path))
    } else {
        let cwd = std::env::current_dir()?;
        Ok(lexical_clean(&cwd.join(path)))
    }
}

/// Resolve `.` and `..` components lexically, without touching the
/// filesystem. `..` at the root stays at the root.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir => out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(Component::ParentDir);
                }
            }
            Component::Normal(seg) => out.push(seg),
            Component::Prefix(_) => {}
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::CurDir);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexical_clean() {
        assert_eq!(lexical_clean(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(lexical_clean(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(lexical_clean(Path::new("/a//./b/")), PathBuf::from("/a/b"));
        assert_eq!(lexical_clean(Path::new("/")), PathBuf::from("/"));
        assert_eq!(lexical_clean(Path::new("a/./b")), PathBuf::from("a/b"));
    }

    #[test]
    fn test_contained_paths_resolve() {
        let base = Path::new("/srv/data");
        assert_eq!(safe_sub_path(base, "x/y.txt").unwrap(), PathBuf::from("/srv/data/x/y.txt"));
        assert_eq!(safe_sub_path(base, ".").unwrap(), PathBuf::from("/srv/data"));
        assert_eq!(safe_sub_path(base, "a/../b").unwrap(), PathBuf::from("/srv/data/b"));
        // Leading slashes are treated as relative to the base, not the root.
        assert_eq!(safe_sub_path(base, "/etc/passwd").unwrap(), PathBuf::from("/srv/data/etc/passwd"));
    }

    #[test]
    fn test_traversal_rejected() {
        let base = Path::new("/srv/data");
        assert!(matches!(safe_sub_path(base, ".."), Err(PathError::EscapeDetected)));
        assert!(matches!(safe_sub_path(base, "../x"), Err(PathError::EscapeDetected)));
        assert!(matches!(safe_sub_path(base, "a/../../x"), Err(PathError::EscapeDetected)));
    }

    #[test]
    fn test_sibling_prefix_not_contained() {
        // "/srv/database" must not count as inside "/srv/data".
        let base = Path::new("/srv/data");
        assert!(matches!(safe_sub_path(base, "../database/x"), Err(PathError::EscapeDetected)));
    }

    #[test]
    fn test_root_base_allows_everything() {
        assert_eq!(safe_sub_path(Path::new("/"), "etc/passwd").unwrap(), PathBuf::from("/etc/passwd"));
        assert_eq!(safe_sub_path(Path::new("/"), "../etc").unwrap(), PathBuf::from("/etc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_component_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        std::fs::create_dir(base.join("real")).unwrap();
        std::os::unix::fs::symlink(base.join("real"), base.join("link")).unwrap();

        assert!(matches!(
            safe_path(base, "link/file.txt"),
            Err(PathError::ContainsSymlink)
        ));
        assert!(safe_path(base, "real/file.txt").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_leaf_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        std::fs::write(base.join("target.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(base.join("target.txt"), base.join("alias.txt")).unwrap();

        assert!(matches!(safe_path(base, "alias.txt"), Err(PathError::ContainsSymlink)));
    }

    #[test]
    fn test_missing_intermediates_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let got = safe_path(dir.path(), "not/yet/created.txt").unwrap();
        assert!(got.starts_with(dir.path()));
    }
}
