//! Export destination whitelist.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;

/// Why an export path was refused.
#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("Path cannot be empty")]
    Empty,
    #[error("Path contains invalid null bytes")]
    NulByte,
    #[error("Path contains traversal sequences (..)")]
    Traversal,
    #[error("Failed to resolve path: {0}")]
    Resolve(#[from] io::Error),
    #[error("Path must be absolute")]
    NotAbsolute,
    #[error("Path {} is outside allowed directories: {allowed}", .path.display())]
    Outside { path: PathBuf, allowed: String },
}

/// Directories exports may be written under.
#[derive(Debug, Clone)]
pub struct ExportWhitelist {
    roots: Vec<PathBuf>,
}

impl ExportWhitelist {
    #[must_use]
    pub const fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    /// `~/Exports` and `~/Documents/TraeExports`.
    #[must_use]
    pub fn for_home(home: &Path) -> Self {
        Self::new(vec![
            home.join("Exports"),
            home.join("Documents").join("TraeExports"),
        ])
    }

    /// Whitelist for the current user's home directory, if one is known.
    #[must_use]
    pub fn from_home_dir() -> Option<Self> {
        dirs::home_dir().map(|home| Self::for_home(&home))
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validate and normalize a caller-supplied export path.
    ///
    /// # Errors
    /// Returns error if the path is malformed or resolves outside every root.
    pub fn validate(&self, user_path: &str) -> Result<PathBuf, WhitelistError> {
        if user_path.is_empty() {
            return Err(WhitelistError::Empty);
        }
        if user_path.contains('\0') {
            return Err(WhitelistError::NulByte);
        }
        // Checked on the raw text, before anything is normalized away.
        if user_path.split('/').any(|seg| seg == "..") {
            return Err(WhitelistError::Traversal);
        }

        let resolved = resolve_lenient(Path::new(user_path))?;
        if !resolved.is_absolute() {
            return Err(WhitelistError::NotAbsolute);
        }

        for root in &self.roots {
            let root = resolve_lenient(root)?;
            if resolved.starts_with(&root) {
                return Ok(resolved);
            }
        }

        Err(WhitelistError::Outside {
            path: resolved,
            allowed: self
                .roots
                .iter()
                .map(|r| r.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Make `path` absolute and follow symlinks on its longest existing prefix.
///
/// The remainder need not exist. Callers must have rejected `..` already.
fn resolve_lenient(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(base) => {
                let mut out = base;
                for part in rest.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(parent) = existing.parent() else {
                    return Err(e);
                };
                if let Some(Component::Normal(name)) = existing.components().next_back() {
                    rest.push(name.to_os_string());
                }
                existing = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use super::*;

    fn setup() -> (tempfile::TempDir, ExportWhitelist) {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir_all(home.path().join("Exports")).unwrap();
        let list = ExportWhitelist::for_home(home.path());
        (home, list)
    }

    #[test]
    fn accepts_paths_under_roots() {
        let (home, list) = setup();
        let target = home.path().join("Exports/trip/new");
        let ok = list.validate(target.to_str().unwrap()).unwrap();
        assert!(ok.ends_with("Exports/trip/new"));

        // The second root need not exist yet.
        let docs = home.path().join("Documents/TraeExports/x");
        assert!(list.validate(docs.to_str().unwrap()).is_ok());
    }

    #[test]
    fn rejects_malformed() {
        let (home, list) = setup();
        assert!(matches!(list.validate(""), Err(WhitelistError::Empty)));
        assert!(matches!(list.validate("/a\0b"), Err(WhitelistError::NulByte)));
        let sneaky = format!("{}/Exports/../.ssh", home.path().display());
        assert!(matches!(list.validate(&sneaky), Err(WhitelistError::Traversal)));
    }

    #[test]
    fn rejects_outside() {
        let (_home, list) = setup();
        assert!(matches!(list.validate("/etc"), Err(WhitelistError::Outside { .. })));
    }

    #[test]
    fn symlink_escape_is_caught() {
        let (home, list) = setup();
        let outside = tempfile::tempdir().unwrap();
        let link = home.path().join("Exports/escape");
        symlink(outside.path(), &link).unwrap();

        let attempt = link.join("photo.jpg");
        assert!(matches!(
            list.validate(attempt.to_str().unwrap()),
            Err(WhitelistError::Outside { .. })
        ));
    }
}
