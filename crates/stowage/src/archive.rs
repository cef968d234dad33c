use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::job::target_base_name;

pub const ARCHIVE_SUFFIX: &str = ".bak.tar.gz";
const SENTINEL_NAME: &str = ".stowage_testwrite.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// `<base>[-<tag>].bak.tar.gz`
pub fn archive_file_name(base: &str, tag: Option<&str>) -> String {
    match tag.filter(|t| !t.is_empty()) {
        Some(tag) => format!("{base}-{tag}{ARCHIVE_SUFFIX}"),
        None => format!("{base}{ARCHIVE_SUFFIX}"),
    }
}

/// Prove `dir` accepts new files by creating and removing a sentinel.
pub fn ensure_writable(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir)
        .map_err(|e| Error::archive(format!("output directory {}: {e}", dir.display())))?;
    if !meta.is_dir() {
        return Err(Error::archive(format!(
            "output path {} is not a directory",
            dir.display()
        )));
    }
    let sentinel = dir.join(SENTINEL_NAME);
    File::create(&sentinel).map_err(|e| {
        Error::archive(format!("cannot write to output directory {}: {e}", dir.display()))
    })?;
    if let Err(e) = fs::remove_file(&sentinel) {
        tracing::warn!(path = %sentinel.display(), error = %e, "failed to remove write-check sentinel");
    }
    Ok(())
}

/// Writes `source` as a gzip'd tar whose entries all sit under
/// `<source-name>/`. The archive only appears at `dest` once complete.
pub fn create_archive(source: &Path, dest: &Path) -> Result<Archive> {
    let meta = fs::metadata(source)
        .map_err(|e| Error::archive(format!("invalid source directory {}: {e}", source.display())))?;
    if !meta.is_dir() {
        return Err(Error::archive(format!(
            "source {} is not a directory",
            source.display()
        )));
    }
    let dest_dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_writable(dest_dir)?;

    let root_name = target_base_name(source);
    let tmp = tempfile::Builder::new()
        .prefix(".stowage-archive")
        .suffix(".partial")
        .tempfile_in(dest_dir)
        .map_err(|e| Error::archive(format!("failed to create temp file in {}: {e}", dest_dir.display())))?;

    let writer = BufWriter::new(tmp.as_file().try_clone().map_err(|e| {
        Error::archive(format!("failed to open temp archive: {e}"))
    })?);
    let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
    let entries = append_tree(&mut builder, source, &root_name)?;

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::archive(format!("failed to finish tar stream: {e}")))?;
    let writer = encoder
        .finish()
        .map_err(|e| Error::archive(format!("failed to finish gzip stream: {e}")))?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::archive(format!("failed to flush archive: {}", e.error())))?;
    file.sync_all()
        .map_err(|e| Error::archive(format!("failed to sync archive: {e}")))?;
    drop(file);

    // On any early return above, dropping `tmp` deletes the partial file.
    tmp.persist(dest).map_err(|e| {
        Error::archive(format!("failed to move archive into place at {}: {}", dest.display(), e.error))
    })?;

    let size_bytes = fs::metadata(dest)
        .map_err(|e| Error::archive(format!("failed to stat {}: {e}", dest.display())))?
        .len();
    let sha256 = file_sha256(dest)
        .map_err(|e| Error::archive(format!("failed to hash {}: {e}", dest.display())))?;

    tracing::info!(
        source = %source.display(),
        archive = %dest.display(),
        entries,
        size_bytes,
        "directory archived"
    );
    Ok(Archive {
        path: dest.to_path_buf(),
        size_bytes,
        sha256,
    })
}

fn append_tree<W: io::Write>(builder: &mut Builder<W>, source: &Path, root_name: &str) -> Result<usize> {
    let mut count = 0usize;
    let walker = WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| Error::archive(format!("failed to walk {}: {e}", source.display())))?;
        let path = entry.path();
        let rel = path
            .strip_prefix(source)
            .map_err(|e| Error::archive(format!("strip_prefix failed for {}: {e}", path.display())))?;
        let name = if rel.as_os_str().is_empty() {
            PathBuf::from(root_name)
        } else {
            Path::new(root_name).join(rel)
        };
        // A symlinked source root is walked through, so store it as the directory it points at.
        let meta = if entry.depth() == 0 {
            fs::metadata(path)
        } else {
            entry.metadata().map_err(io::Error::from)
        }
        .map_err(|e| Error::archive(format!("failed to stat {}: {e}", path.display())))?;
        let ft = meta.file_type();

        let mut header = Header::new_gnu();
        header.set_metadata(&meta);
        if ft.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &name, io::empty())
                .map_err(|e| entry_err(path, e))?;
        } else if ft.is_symlink() {
            let target = fs::read_link(path)
                .map_err(|e| Error::archive(format!("failed to read symlink {}: {e}", path.display())))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, &name, &target)
                .map_err(|e| entry_err(path, e))?;
        } else if ft.is_file() {
            let file = File::open(path)
                .map_err(|e| Error::archive(format!("failed to open {}: {e}", path.display())))?;
            append_file(builder, &mut header, &name, BufReader::new(file), meta.len())
                .map_err(|e| entry_err(path, e))?;
        } else {
            tracing::warn!(path = %path.display(), "skipping special file");
            continue;
        }
        count += 1;
    }
    Ok(count)
}

/// Counts what the tar builder actually pulled from a file.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Append exactly `len` bytes of `reader`. A file that changed size since it
/// was stat'ed would desync the stream from the header, so that is an error.
fn append_file<W: io::Write, R: Read>(
    builder: &mut Builder<W>,
    header: &mut Header,
    name: &Path,
    reader: R,
    len: u64,
) -> io::Result<()> {
    header.set_size(len);
    let mut counted = CountingReader {
        inner: reader.take(len),
        count: 0,
    };
    builder.append_data(header, name, &mut counted)?;
    if counted.count != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file changed while archiving: expected {len} bytes, read {}", counted.count),
        ));
    }
    Ok(())
}

fn entry_err(path: &Path, e: io::Error) -> Error {
    Error::archive(format!("failed to add {} to archive: {e}", path.display()))
}

fn file_sha256(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::error::ErrorKind;

    fn read_entries(archive: &Path) -> BTreeMap<String, (EntryType, Vec<u8>, Option<PathBuf>)> {
        let file = File::open(archive).expect("open archive");
        let mut ar = tar::Archive::new(GzDecoder::new(file));
        let mut out = BTreeMap::new();
        for entry in ar.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let name = entry.path().expect("path").to_string_lossy().to_string();
            let kind = entry.header().entry_type();
            let link = entry.link_name().expect("link").map(|l| l.into_owned());
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("body");
            out.insert(name.trim_end_matches('/').to_string(), (kind, body, link));
        }
        out
    }

    #[test]
    fn file_name_includes_optional_tag() {
        assert_eq!(archive_file_name("svc1", None), "svc1.bak.tar.gz");
        assert_eq!(archive_file_name("svc1", Some("pre-upgrade")), "svc1-pre-upgrade.bak.tar.gz");
        assert_eq!(archive_file_name("svc1", Some("")), "svc1.bak.tar.gz");
    }

    #[test]
    fn entries_are_rooted_at_source_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("data").join("svc1");
        fs::create_dir_all(src.join("b")).expect("mkdir");
        fs::write(src.join("a.txt"), b"hello").expect("a");
        fs::write(src.join("b/c.txt"), b"0123456789").expect("c");
        let out_dir = tmp.path().join("out");
        fs::create_dir_all(&out_dir).expect("out");
        let dest = out_dir.join(archive_file_name("svc1", None));

        let archive = create_archive(&src, &dest).expect("archive");
        assert_eq!(archive.size_bytes, fs::metadata(&dest).expect("meta").len());
        assert_eq!(archive.sha256.len(), 64);

        let entries = read_entries(&dest);
        assert_eq!(entries["svc1"].0, EntryType::Directory);
        assert_eq!(entries["svc1/b"].0, EntryType::Directory);
        assert_eq!(entries["svc1/a.txt"].1, b"hello".to_vec());
        assert_eq!(entries["svc1/b/c.txt"].1.len(), 10);
        assert_eq!(entries.len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_stored_as_links() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("svc");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("real.conf"), b"x=1").expect("real");
        std::os::unix::fs::symlink("real.conf", src.join("current.conf")).expect("symlink");
        std::os::unix::fs::symlink("/does/not/exist", src.join("dangling")).expect("dangling");
        let dest = tmp.path().join("svc.bak.tar.gz");

        create_archive(&src, &dest).expect("archive");
        let entries = read_entries(&dest);
        let (kind, body, link) = &entries["svc/current.conf"];
        assert_eq!(*kind, EntryType::Symlink);
        assert!(body.is_empty());
        assert_eq!(link.as_deref(), Some(Path::new("real.conf")));
        assert_eq!(entries["svc/dangling"].0, EntryType::Symlink);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_source_is_archived_under_link_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let real = tmp.path().join("svc-v2");
        fs::create_dir_all(&real).expect("mkdir");
        fs::write(real.join("app.env"), b"PORT=80").expect("env");
        let link = tmp.path().join("current");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");
        let dest = tmp.path().join("current.bak.tar.gz");

        create_archive(&link, &dest).expect("archive");
        let entries = read_entries(&dest);
        assert_eq!(entries["current"].0, EntryType::Directory);
        assert_eq!(entries["current/app.env"].1, b"PORT=80".to_vec());
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn missing_source_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dest = tmp.path().join("ghost.bak.tar.gz");
        let err = create_archive(&tmp.path().join("ghost"), &dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Archive);
        assert!(!dest.exists());
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).expect("readdir").collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unwritable_destination_fails_before_archiving() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("svc");
        fs::create_dir_all(&src).expect("mkdir");
        let dest = tmp.path().join("no-such-dir").join("svc.bak.tar.gz");
        let err = create_archive(&src, &dest).unwrap_err();
        assert!(err.to_string().contains("output directory"), "{err}");
    }

    #[test]
    fn file_that_grew_is_cut_at_stat_size() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        append_file(&mut builder, &mut header, Path::new("svc/log"), &b"hello world"[..], 5)
            .expect("append");
        let mut next = Header::new_gnu();
        next.set_mode(0o644);
        append_file(&mut builder, &mut next, Path::new("svc/next"), &b"ok"[..], 2).expect("append next");
        let bytes = builder.into_inner().expect("finish");

        let mut ar = tar::Archive::new(&bytes[..]);
        let mut seen = Vec::new();
        for entry in ar.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let mut body = String::new();
            entry.read_to_string(&mut body).expect("body");
            seen.push((entry.path().expect("path").display().to_string(), body));
        }
        assert_eq!(
            seen,
            vec![
                ("svc/log".to_string(), "hello".to_string()),
                ("svc/next".to_string(), "ok".to_string()),
            ]
        );
    }

    #[test]
    fn file_that_shrank_is_an_error() {
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_mode(0o644);
        let err = append_file(&mut builder, &mut header, Path::new("svc/log"), &b"abc"[..], 5).unwrap_err();
        assert!(err.to_string().contains("changed while archiving"), "{err}");
    }

    #[test]
    fn sentinel_is_removed_after_write_check() {
        let tmp = tempfile::tempdir().expect("tempdir");
        ensure_writable(tmp.path()).expect("writable");
        assert!(!tmp.path().join(SENTINEL_NAME).exists());
    }

    #[test]
    fn rerun_replaces_previous_archive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("svc");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("v"), b"one").expect("v1");
        let dest = tmp.path().join("svc.bak.tar.gz");
        create_archive(&src, &dest).expect("first");
        fs::write(src.join("v"), b"two!").expect("v2");
        create_archive(&src, &dest).expect("second");
        assert_eq!(read_entries(&dest)["svc/v"].1, b"two!".to_vec());
    }
}
