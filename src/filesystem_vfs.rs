use std::fs::{File, OpenOptions};
use std::io::*;
use std::path::{Path, PathBuf};

use crate::*;

/// A VFS which is backed by a given root directory.
///
/// This handles the rather tricky path cases around Windows and Linux differences, and makes it so that you can and
/// should use keys like `cache/pc/objects.toc` or `/cache/pc/objects.toc` (behavior with `\` is undefined).
/// Additionally, it makes a best effort to disallow a user to use relative paths to escape the root directory,
/// primarily as a measure to detect bugs.
#[derive(Debug)]
pub struct FilesystemVfs {
    root_path: PathBuf,
}

fn conv_path(path: impl AsRef<Path>) -> Result<relative_path::RelativePathBuf> {
    relative_path::RelativePathBuf::from_path(path)
        .map_err(|_| Error::new(ErrorKind::Other, "Invalid path"))
}

impl FilesystemVfs {
    pub fn new(root_path: &Path) -> std::io::Result<FilesystemVfs> {
        Ok(FilesystemVfs {
            root_path: root_path.to_path_buf(),
        })
    }

    /// Resolve a key to a path under the root, so that this can be reused for normal file access at the same time.
    pub fn resolve(&self, key: &str) -> std::io::Result<PathBuf> {
        // On Windows, canonicalize is currently very broken when relative path segments appear in the middle of a
        // path, and stdlib doesn't help us out. Go via `RelativePathBuf` to clean it up.
        let absolute = conv_path(key.trim_start_matches('/'))?.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) {
            return Err(Error::new(
                ErrorKind::Other,
                "path is outside the vfs root directory",
            ));
        }
        Ok(absolute)
    }

    pub fn open_file(&self, key: &str) -> std::io::Result<File> {
        File::open(self.resolve(key)?)
    }

    fn open_for_write(&self, key: &str) -> std::io::Result<File> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().write(true).create(true).open(absolute)
    }
}

impl Vfs for FilesystemVfs {
    fn file_size(&self, key: &str) -> std::io::Result<Option<u64>> {
        match std::fs::metadata(self.resolve(key)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_at(&self, key: &str, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        let mut file = self.open_file(key)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut out = vec![0; len];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    fn write_at(&self, key: &str, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.open_for_write(key)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    fn replace(&self, key: &str, data: &[u8]) -> std::io::Result<()> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write next to the target and rename over it, so readers never see a half-written file.
        let mut staging = absolute.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, data)?;
        std::fs::rename(&staging, &absolute)
    }
}
