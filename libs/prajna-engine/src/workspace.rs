use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Per-run working directory, removed on drop.
///
/// The directory and every file in it are named after a random v4 UUID, so
/// concurrent runs never collide and nothing is guessable from a counter.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    dir: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;

        let id = Uuid::new_v4().simple().to_string();
        // Absolute, so the path can be handed to a container daemon as is
        let dir = fs::canonicalize(root)?.join(&id);
        // create_dir (not _all): an existing directory means a collision
        fs::create_dir(&dir)?;

        Ok(Self { id, dir })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// `<id>.<extension>`
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{}", self.id, extension)
    }

    pub fn write(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.dir.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Failed to remove workspace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(root.path()).unwrap();
            ws.write(&ws.file_name("py"), "print(1)").unwrap();
            ws.path().to_path_buf()
        };

        assert!(!path.exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_names_are_unique_and_random() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path()).unwrap();
        let b = Workspace::create(root.path()).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
        assert_eq!(a.file_name("cpp"), format!("{}.cpp", a.id()));
    }

    #[test]
    fn test_creates_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("temp_codes");
        let ws = Workspace::create(&nested).unwrap();
        assert!(ws.path().is_absolute());
        assert!(ws.path().starts_with(fs::canonicalize(&nested).unwrap()));
    }
}
