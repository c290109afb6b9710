//! Small filesystem copy helpers shared by the local backend and the
//! artifact exporter.

use std::fs;
use std::io;
use std::path::Path;

/// Create a directory and all parents with mode 0755.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Copy a file or directory tree. Directories are created on demand;
/// symlinks are not followed into the destination.
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        ensure_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let child_dst = dst.join(entry.file_name());
            if file_type.is_symlink() {
                tracing::warn!(
                    "skipping symlink during copy: {}",
                    entry.path().display()
                );
                continue;
            }
            copy_path(&entry.path(), &child_dst)?;
        }
        Ok(())
    } else {
        if let Some(parent) = dst.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(src, dst)?;
        Ok(())
    }
}

/// Set the mode of a delivered file (no-op on non-unix targets).
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_single_file_creates_parents() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a.txt");
        fs::write(&src, b"data").unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = dst_dir.path().join("deep/nested/a.txt");
        copy_path(&src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }

    #[test]
    fn test_copy_directory_recursive() {
        let src_dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(src_dir.path().join("sub")).unwrap();
        fs::write(src_dir.path().join("top.txt"), b"top").unwrap();
        fs::write(src_dir.path().join("sub/inner.txt"), b"inner").unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = dst_dir.path().join("copy");
        copy_path(src_dir.path(), &dst).unwrap();

        assert_eq!(fs::read(dst.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read(dst.join("sub/inner.txt")).unwrap(), b"inner");
    }
}
