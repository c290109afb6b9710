//! In-band tar streams for container copy operations and repository
//! archives.
//!
//! Copy-out demultiplexes a `tar cf -` stream produced inside the
//! container. Entries whose names do not begin with the sanitized source
//! prefix are rejected; symlinks are skipped with a warning.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType};

/// Strip `../` sequences and a leading `/` from a path string.
pub fn strip_path_shortcuts(p: &str) -> String {
    let mut path = clean_path(p);
    loop {
        let trimmed = path.trim_start_matches("../").to_string();
        if trimmed == path {
            break;
        }
        path = trimmed;
    }
    if path == "." || path == ".." {
        path = String::new();
    }
    path.strip_prefix('/').map(str::to_string).unwrap_or(path)
}

fn clean_path(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let absolute = p.starts_with('/');
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(&"..")) || (parts.is_empty() && !absolute) {
                    parts.push("..");
                } else {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// The prefix tar strips from entries of `tar cf - <src>`.
pub fn sanitized_prefix(src: &str) -> String {
    strip_path_shortcuts(src.trim_start_matches('/'))
}

/// Unpack a tar stream produced by `tar cf - <src>` in the container.
///
/// Files land under `dest_dir/<basename(src)>` (plus their path relative
/// to `src` when `src` is a directory). Returns the number of files
/// written.
pub fn unpack(reader: impl Read, dest_dir: &Path, src: &str) -> io::Result<usize> {
    let prefix = sanitized_prefix(src);
    let base = Path::new(src)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_default();
    let mut archive = Archive::new(reader);
    let mut written = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let cleaned = strip_path_shortcuts(&name);
        if !cleaned.starts_with(&prefix) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("tar contents corrupted: unexpected entry {}", name),
            ));
        }
        if entry.header().entry_type() == EntryType::Directory {
            continue;
        }
        if matches!(
            entry.header().entry_type(),
            EntryType::Symlink | EntryType::Link
        ) {
            tracing::warn!("skipping symlink in copy stream: {}", name);
            continue;
        }
        let rel = cleaned
            .strip_prefix(&prefix)
            .unwrap_or("")
            .trim_start_matches('/');
        let dest = if rel.is_empty() {
            dest_dir.join(&base)
        } else {
            dest_dir.join(&base).join(rel)
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

/// Pack a file or directory into an uncompressed tar stream whose root
/// entry is named `entry_name`.
pub fn pack(src: &Path, entry_name: &str) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    if src.is_dir() {
        builder.append_dir_all(entry_name, src)?;
    } else {
        let mut file = fs::File::open(src)?;
        builder.append_file(entry_name, &mut file)?;
    }
    builder.into_inner()
}

/// Create a gzip-compressed tar archive of a directory's contents
/// (entries relative to `src_dir`).
pub fn archive_gz(src_dir: &Path, dest_file: &Path) -> io::Result<()> {
    let dest = fs::File::create(dest_file)?;
    let encoder = GzEncoder::new(dest, Compression::best());
    let mut builder = Builder::new(encoder);
    append_dir_contents(&mut builder, src_dir, Path::new(""))?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

fn append_dir_contents<W: Write>(
    builder: &mut Builder<W>,
    dir: &Path,
    rel: &Path,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let entry_rel = rel.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            append_dir_contents(builder, &path, &entry_rel)?;
        } else if file_type.is_file() {
            let mut file = fs::File::open(&path)?;
            builder.append_file(&entry_rel, &mut file)?;
        }
        // Symlinks are not carried into repository archives.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_path_shortcuts() {
        assert_eq!(strip_path_shortcuts("/work/artifact"), "work/artifact");
        assert_eq!(strip_path_shortcuts("../../etc/passwd"), "etc/passwd");
        assert_eq!(strip_path_shortcuts("./work"), "work");
        assert_eq!(strip_path_shortcuts(".."), "");
        assert_eq!(strip_path_shortcuts("."), "");
        assert_eq!(strip_path_shortcuts("a/./b/../c"), "a/c");
    }

    #[test]
    fn test_pack_and_unpack_single_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("artifact");
        fs::write(&src, b"payload").unwrap();

        // Simulate `tar cf - /work/artifact` inside the container.
        let bytes = pack(&src, "work/artifact").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let written = unpack(&bytes[..], dest.path(), "/work/artifact").unwrap();
        assert_eq!(written, 1);
        assert_eq!(
            fs::read(dest.path().join("artifact")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn test_pack_and_unpack_directory() {
        let src_dir = tempfile::tempdir().unwrap();
        let dir = src_dir.path().join("out");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("a.txt"), b"a").unwrap();
        fs::write(dir.join("nested/b.txt"), b"b").unwrap();

        let bytes = pack(&dir, "work/out").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let written = unpack(&bytes[..], dest.path(), "/work/out").unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read(dest.path().join("out/a.txt")).unwrap(), b"a");
        assert_eq!(
            fs::read(dest.path().join("out/nested/b.txt")).unwrap(),
            b"b"
        );
    }

    #[test]
    fn test_unpack_rejects_traversal() {
        let mut builder = Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_cksum();
        builder
            .append_data(&mut header, "other/escape", &b"evil"[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let err = unpack(&bytes[..], dest.path(), "/work/artifact").unwrap_err();
        assert!(err.to_string().contains("tar contents corrupted"));
    }

    #[test]
    fn test_unpack_skips_symlinks() {
        let mut builder = Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "work/artifact/link", "/etc/passwd")
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        let dest = tempfile::tempdir().unwrap();
        let written = unpack(&bytes[..], dest.path(), "/work/artifact").unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_archive_gz_round_trip() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("src")).unwrap();
        fs::write(src.path().join("README.md"), b"hello").unwrap();
        fs::write(src.path().join("src/main.rs"), b"fn main() {}").unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = archive_dir.path().join("repo.tar.gz");
        archive_gz(src.path(), &archive_path).unwrap();

        let file = fs::File::open(&archive_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"README.md".to_string()));
        assert!(names.contains(&"src/main.rs".to_string()));
    }
}
