//! Filesystem operations confined to an export root.
//!
//! Every remote path is cleaned lexically, joined onto the root and
//! canonicalized with symlink evaluation before any syscall touches it.
//! A resolved path outside the root is a traversal error, full stop.
//! Error messages never contain the export root's own text.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{FileInfo, ListResponse, ReadResponse, StatResponse, WriteResponse};
use crate::{Error, Result};

/// Reads are capped to keep a single request from pinning memory.
const MAX_READ_SIZE: i64 = 10 * 1024 * 1024;

const CREATE_FILE_MODE: u32 = 0o644;

pub struct SecureFilesystem {
    export_root: PathBuf,
    read_only: bool,
}

impl SecureFilesystem {
    /// Creates a sandboxed filesystem rooted at `root`, which must be an
    /// existing directory. The stored root is canonical and absolute.
    pub fn new(root: &Path, read_only: bool) -> Result<Self> {
        let export_root = fs::canonicalize(root)
            .map_err(|_| Error::InvalidPath("shared path does not exist".to_string()))?;

        let metadata = fs::metadata(&export_root)?;
        if !metadata.is_dir() {
            return Err(Error::InvalidPath("shared path is not a directory".to_string()));
        }

        Ok(Self {
            export_root,
            read_only,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn root_path(&self) -> &Path {
        &self.export_root
    }

    /// Resolves a remote path to a real path inside the export root.
    ///
    /// Targets that do not exist yet (create-style operations) resolve
    /// through their parent directory instead, so a symlinked parent
    /// cannot smuggle the final component outside.
    fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let cleaned = clean_relative(requested);
        let full = self.export_root.join(cleaned);

        let resolved = match fs::canonicalize(&full) {
            Ok(resolved) => resolved,
            Err(_) => {
                let parent = full
                    .parent()
                    .ok_or_else(|| Error::InvalidPath(requested.to_string()))?;
                let leaf = full
                    .file_name()
                    .ok_or_else(|| Error::InvalidPath(requested.to_string()))?;
                let parent_resolved = fs::canonicalize(parent)
                    .map_err(|_| Error::InvalidPath(requested.to_string()))?;
                parent_resolved.join(leaf)
            }
        };

        // Component-wise prefix check: equal to the root or strictly below it
        if !resolved.starts_with(&self.export_root) {
            return Err(Error::PathTraversal);
        }

        Ok(resolved)
    }

    /// Enumerates a directory. Symlinked entries are verified against the
    /// root; broken or escaping links are silently omitted.
    pub fn list(&self, path: &str) -> Result<ListResponse> {
        let safe = self.resolve(path)?;
        let entries = fs::read_dir(&safe).map_err(|e| map_io(path, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(_) => continue,
            };

            if file_type.is_symlink() {
                match fs::canonicalize(entry.path()) {
                    Ok(target) if target.starts_with(&self.export_root) => {}
                    _ => continue,
                }
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            files.push(file_info(&entry.file_name().to_string_lossy(), &metadata));
        }

        Ok(ListResponse { files })
    }

    pub fn stat(&self, path: &str) -> Result<StatResponse> {
        let safe = self.resolve(path)?;
        let metadata = fs::metadata(&safe).map_err(|e| map_io(path, e))?;

        let name = safe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        Ok(StatResponse {
            info: file_info(&name, &metadata),
        })
    }

    /// Reads up to `length` bytes at `offset`.
    ///
    /// The offset must lie within `[0, size]`. A non-positive length, or
    /// one that overshoots the end, is clamped to the remainder of the
    /// file; the actual read never exceeds 10 MiB.
    pub fn read(&self, path: &str, offset: i64, length: i64) -> Result<ReadResponse> {
        let safe = self.resolve(path)?;
        let mut file = File::open(&safe).map_err(|e| map_io(path, e))?;

        let size = file.metadata()?.len() as i64;
        if offset < 0 || offset > size {
            return Err(invalid_input("invalid offset"));
        }

        let mut length = length;
        if length <= 0 || offset.checked_add(length).map_or(true, |end| end > size) {
            length = size - offset;
        }
        if length > MAX_READ_SIZE {
            length = MAX_READ_SIZE;
        }

        let want = usize::try_from(length).map_err(|_| invalid_input("invalid length"))?;

        file.seek(SeekFrom::Start(offset as u64))?;

        let mut data = vec![0u8; want];
        let mut total = 0;
        while total < data.len() {
            match file.read(&mut data[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        data.truncate(total);

        Ok(ReadResponse { data })
    }

    /// Writes `data` at `offset`, creating the file with mode 0644 if it
    /// does not exist. Forbidden in read-only mode.
    pub fn write(&self, path: &str, offset: i64, data: &[u8]) -> Result<WriteResponse> {
        if self.read_only {
            return Err(Error::PermissionDenied);
        }

        let safe = self.resolve(path)?;
        if offset < 0 {
            return Err(invalid_input("invalid offset"));
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(CREATE_FILE_MODE);
        }

        let mut file = options.open(&safe).map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;

        Ok(WriteResponse {
            bytes_written: data.len() as i64,
        })
    }

    /// Removes a file or directory tree. The export root itself is
    /// untouchable. Forbidden in read-only mode.
    pub fn delete(&self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::PermissionDenied);
        }

        let safe = self.resolve(path)?;
        if safe == self.export_root {
            return Err(Error::PermissionDenied);
        }

        let metadata = fs::symlink_metadata(&safe).map_err(|e| map_io(path, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&safe).map_err(|e| map_io(path, e))?;
        } else {
            fs::remove_file(&safe).map_err(|e| map_io(path, e))?;
        }

        Ok(())
    }

    /// Renames within the sandbox; neither endpoint may be the root.
    /// Forbidden in read-only mode.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::PermissionDenied);
        }

        let safe_old = self.resolve(old_path)?;
        let safe_new = self.resolve(new_path)?;

        if safe_old == self.export_root || safe_new == self.export_root {
            return Err(Error::PermissionDenied);
        }

        fs::rename(&safe_old, &safe_new).map_err(|e| map_io(old_path, e))?;
        Ok(())
    }

    /// Creates a directory and any missing parents with the given mode.
    /// Forbidden in read-only mode.
    pub fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::PermissionDenied);
        }

        let safe = self.resolve(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(perm)
                .create(&safe)
                .map_err(|e| map_io(path, e))?;
        }
        #[cfg(not(unix))]
        {
            let _ = perm;
            fs::create_dir_all(&safe).map_err(|e| map_io(path, e))?;
        }

        Ok(())
    }
}

/// Lexical cleanup: `.` disappears, `..` pops (never past the top),
/// leading separators and prefixes are dropped so the result is always
/// relative.
fn clean_relative(path: &str) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    cleaned
}

fn file_info(name: &str, metadata: &fs::Metadata) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: metadata.len() as i64,
        mode: mode_bits(metadata),
        mtime: mtime_seconds(metadata),
        is_dir: metadata.is_dir(),
    }
}

#[cfg(unix)]
fn mode_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    metadata.mode()
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &fs::Metadata) -> u32 {
    0
}

fn mtime_seconds(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// The requested path is remote input and safe to echo; the export root
/// never is.
fn map_io(requested: &str, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(requested.to_string()),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied,
        _ => Error::Io(e),
    }
}

fn invalid_input(message: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        message,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, SecureFilesystem) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/notes.md"), b"# notes\nsome text").unwrap();

        let sfs = SecureFilesystem::new(dir.path(), false).unwrap();
        (dir, sfs)
    }

    // ============================================================================
    // Path Confinement Tests
    // ============================================================================

    #[test]
    fn test_parent_traversal_rejected() {
        let (_dir, sfs) = fixture();

        for path in ["/../etc/passwd", "../../secret", "/docs/../../../etc/shadow"] {
            let result = sfs.read(path, 0, 100);
            assert!(
                matches!(result, Err(Error::PathTraversal) | Err(Error::InvalidPath(_)) | Err(Error::NotFound(_))),
                "path {} must not resolve outside the root, got {:?}",
                path,
                result
            );
        }
    }

    #[test]
    fn test_absolute_path_treated_as_relative() {
        let (_dir, sfs) = fixture();

        // A literal absolute path is re-rooted, not honored
        let resp = sfs.read("/hello.txt", 0, 2).unwrap();
        assert_eq!(resp.data, b"hi");

        let result = sfs.read("/etc/passwd", 0, 10);
        assert!(matches!(result, Err(Error::InvalidPath(_)) | Err(Error::NotFound(_))));
    }

    #[test]
    fn test_poison_file_unreachable() {
        // Stage a file next to the export root; no request shape reaches it
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("shared");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("ok.txt"), b"fine").unwrap();
        fs::write(outer.path().join("poison.txt"), b"never read").unwrap();

        let sfs = SecureFilesystem::new(&root, false).unwrap();

        for path in ["../poison.txt", "/../poison.txt", "docs/../../poison.txt"] {
            assert!(sfs.read(path, 0, 100).is_err(), "{} must be unreachable", path);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("shared");
        fs::create_dir(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("evil")).unwrap();

        let sfs = SecureFilesystem::new(&root, false).unwrap();

        assert!(matches!(sfs.stat("/evil"), Err(Error::PathTraversal)));
        assert!(matches!(sfs.read("/evil", 0, 10), Err(Error::PathTraversal)));
    }

    #[cfg(unix)]
    #[test]
    fn test_list_hides_escaping_and_broken_symlinks() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("shared");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("visible.txt"), b"ok").unwrap();
        fs::write(outer.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("evil")).unwrap();
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling")).unwrap();
        std::os::unix::fs::symlink(root.join("visible.txt"), root.join("alias")).unwrap();

        let sfs = SecureFilesystem::new(&root, false).unwrap();
        let resp = sfs.list("/").unwrap();

        let names: Vec<&str> = resp.files.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"visible.txt"));
        assert!(names.contains(&"alias"), "in-root symlinks stay visible");
        assert!(!names.contains(&"evil"), "escaping symlink must be hidden");
        assert!(!names.contains(&"dangling"), "broken symlink must be hidden");
    }

    // ============================================================================
    // Read Semantics Tests
    // ============================================================================

    #[test]
    fn test_read_whole_file() {
        let (_dir, sfs) = fixture();
        let resp = sfs.read("/hello.txt", 0, 2).unwrap();
        assert_eq!(resp.data, b"hi");
    }

    #[test]
    fn test_read_clamps_length() {
        let (_dir, sfs) = fixture();

        // Zero and negative lengths mean "the rest of the file"
        assert_eq!(sfs.read("/hello.txt", 0, 0).unwrap().data, b"hi");
        assert_eq!(sfs.read("/hello.txt", 1, -5).unwrap().data, b"i");
        // Overshooting lengths clamp to the end
        assert_eq!(sfs.read("/hello.txt", 0, 10_000).unwrap().data, b"hi");
        // Reading exactly at the end yields nothing
        assert!(sfs.read("/hello.txt", 2, 10).unwrap().data.is_empty());
    }

    #[test]
    fn test_read_invalid_offset() {
        let (_dir, sfs) = fixture();
        assert!(sfs.read("/hello.txt", -1, 1).is_err());
        assert!(sfs.read("/hello.txt", 3, 1).is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let (_dir, sfs) = fixture();
        assert!(matches!(sfs.read("/nope.txt", 0, 1), Err(Error::NotFound(_))));
    }

    // ============================================================================
    // Mutation Tests
    // ============================================================================

    #[test]
    fn test_write_creates_and_overwrites() {
        let (dir, sfs) = fixture();

        let resp = sfs.write("/new.bin", 0, b"abcdef").unwrap();
        assert_eq!(resp.bytes_written, 6);
        assert_eq!(fs::read(dir.path().join("new.bin")).unwrap(), b"abcdef");

        // Offset write patches in place
        sfs.write("/new.bin", 2, b"XY").unwrap();
        assert_eq!(fs::read(dir.path().join("new.bin")).unwrap(), b"abXYef");
    }

    #[test]
    fn test_delete_file_and_tree() {
        let (dir, sfs) = fixture();

        sfs.delete("/hello.txt").unwrap();
        assert!(!dir.path().join("hello.txt").exists());

        sfs.delete("/docs").unwrap();
        assert!(!dir.path().join("docs").exists());

        assert!(matches!(sfs.delete("/gone"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_root_refused() {
        let (_dir, sfs) = fixture();
        assert!(matches!(sfs.delete("/"), Err(Error::PermissionDenied)));
        assert!(matches!(sfs.delete(""), Err(Error::PermissionDenied)));
        assert!(matches!(sfs.delete("/docs/.."), Err(Error::PermissionDenied)));
    }

    #[test]
    fn test_rename() {
        let (dir, sfs) = fixture();

        sfs.rename("/hello.txt", "/renamed.txt").unwrap();
        assert!(!dir.path().join("hello.txt").exists());
        assert_eq!(fs::read(dir.path().join("renamed.txt")).unwrap(), b"hi");

        assert!(matches!(sfs.rename("/", "/other"), Err(Error::PermissionDenied)));
    }

    #[test]
    fn test_mkdir_recursive() {
        let (dir, sfs) = fixture();

        sfs.mkdir("/a/b/c", 0o755).unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    // ============================================================================
    // Read-Only Mode Tests
    // ============================================================================

    #[test]
    fn test_read_only_rejects_mutations() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), b"data").unwrap();
        let sfs = SecureFilesystem::new(dir.path(), true).unwrap();

        assert!(matches!(sfs.write("/x", 0, b"y"), Err(Error::PermissionDenied)));
        assert!(matches!(sfs.delete("/f.txt"), Err(Error::PermissionDenied)));
        assert!(matches!(sfs.rename("/f.txt", "/g.txt"), Err(Error::PermissionDenied)));
        assert!(matches!(sfs.mkdir("/d", 0o755), Err(Error::PermissionDenied)));

        // Reads still work
        assert_eq!(sfs.read("/f.txt", 0, 4).unwrap().data, b"data");
        assert!(sfs.list("/").is_ok());
        assert!(sfs.stat("/f.txt").is_ok());
    }

    // ============================================================================
    // Metadata Tests
    // ============================================================================

    #[test]
    fn test_list_and_stat_metadata() {
        let (_dir, sfs) = fixture();

        let listing = sfs.list("/").unwrap();
        let hello = listing
            .files
            .iter()
            .find(|f| f.name == "hello.txt")
            .expect("hello.txt should be listed");
        assert_eq!(hello.size, 2);
        assert!(!hello.is_dir);
        assert!(hello.mtime > 0);

        let docs = listing.files.iter().find(|f| f.name == "docs").unwrap();
        assert!(docs.is_dir);

        let stat = sfs.stat("/docs/notes.md").unwrap();
        assert_eq!(stat.info.name, "notes.md");
        assert!(!stat.info.is_dir);
    }

    #[test]
    fn test_constructor_validates_root() {
        assert!(SecureFilesystem::new(Path::new("/definitely/not/here"), false).is_err());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();
        assert!(SecureFilesystem::new(&file, false).is_err());
    }
}
