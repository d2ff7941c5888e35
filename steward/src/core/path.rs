//! Lexical validation of model-supplied relative paths.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Why an artifact path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsafePathReason {
    #[error("path is empty")]
    Empty,
    #[error("path is absolute")]
    Absolute,
    #[error("path contains a parent-directory segment")]
    ParentTraversal,
    #[error("path contains a root or drive prefix")]
    NonNormalComponent,
}

/// Normalize a model-supplied path into a relative path with only normal
/// components.
///
/// `.` segments are dropped. Anything that could leave the directory it is
/// joined onto is rejected instead of being rewritten.
pub fn normalize_relative(raw: &str) -> Result<PathBuf, UnsafePathReason> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UnsafePathReason::Empty);
    }
    // Catch both separators on every platform; `Path::is_absolute` alone would
    // accept `\etc\passwd` on unix.
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || Path::new(trimmed).is_absolute()
    {
        return Err(UnsafePathReason::Absolute);
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => {
                if part.to_string_lossy().split('\\').any(|seg| seg == "..") {
                    return Err(UnsafePathReason::ParentTraversal);
                }
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(UnsafePathReason::ParentTraversal),
            Component::RootDir | Component::Prefix(_) => {
                return Err(UnsafePathReason::NonNormalComponent);
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(UnsafePathReason::Empty);
    }
    Ok(normalized)
}

/// True when joining `raw` onto a directory could resolve above it.
///
/// Purely lexical: a `..` that is balanced by earlier segments does not count.
pub fn escapes_lexically(raw: &str) -> bool {
    let mut depth: usize = 0;
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            _ => depth += 1,
        }
    }
    false
}

/// Render a relative path with `/` separators for ledgers and manifests.
pub fn display_slash(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
