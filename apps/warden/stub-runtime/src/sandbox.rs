use std::{
    io,
    path::{Component, Path, PathBuf},
};

/// File access rules taken from the runtime's permission flags. A denial
/// covering a path always beats an allowance.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    pub allow_read: Vec<PathBuf>,
    pub allow_write: Vec<PathBuf>,
    pub deny_read: Vec<PathBuf>,
    pub deny_write: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Sandbox {
    pub fn check(&self, path: &Path, access: Access) -> io::Result<PathBuf> {
        let resolved = resolve(path)?;
        let (allow, deny) = match access {
            Access::Read => (&self.allow_read, &self.deny_read),
            Access::Write => (&self.allow_write, &self.deny_write),
        };
        let covered = |roots: &[PathBuf]| roots.iter().any(|root| resolved.starts_with(root));
        if covered(deny) || !covered(allow) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{access:?} access to {} denied", resolved.display()),
            ));
        }
        Ok(resolved)
    }

    pub async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let path = self.check(path, Access::Write)?;
        tokio::fs::write(path, contents).await
    }

    pub async fn read(&self, path: &Path) -> io::Result<String> {
        let path = self.check(path, Access::Read)?;
        tokio::fs::read_to_string(path).await
    }
}

/// Absolute, lexically normalised form of `path`; `..` cannot climb out of
/// a checked root.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other.as_os_str()),
        }
    }
    Ok(resolved)
}
