//! Lexical path helpers.
//!
//! Nothing here touches the filesystem: module references and file routes are
//! checked against their roots before any file exists.

use std::path::{Component, Path, PathBuf};

/// Resolves `.` and `..` components without consulting the filesystem.
///
/// A `..` that cannot pop a normal component is kept, so an escaping path
/// stays recognisably escaping.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// `true` when `path`, joined onto any root, stays inside that root.
pub(crate) fn is_contained(path: &Path) -> bool {
    !path.is_absolute()
        && normalize(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
