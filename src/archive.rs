//! Archive sessions: an entry index over a ZIP container that can transition
//! from reading into appending and back out through finalization.

use crate::compression::CompressionMethod;
use crate::path::{base_name, safe_segments, sanitize_name};
use crate::read::{make_entry_reader, read_central_directory, read_entry_bytes};
use crate::result::{ZipError, ZipResult, invalid_archive};
use crate::types::{DateTime, EntryData};
use crate::write::ZipWriter;

use flate2::Compression;
use indexmap::IndexMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// Where an archive session currently stands.
///
/// A session starts read-only, switches to appending on the first `add`, and
/// ends finalized. Each variant says which file handle (if any) is live.
enum Session {
    ReadOnly { file: Option<File> },
    Appending { writer: ZipWriter<File> },
    Finalized,
}

/// A ZIP archive bound to a path on disk.
///
/// Opening never fails: a missing or unparseable container yields an empty
/// archive that the first [`add`](Archive::add) turns into a fresh one.
/// Adding to an archive that already has entries continues it in place,
/// preserving the existing data and rewriting the central directory on
/// [`finalize`](Archive::finalize) (which also runs on drop).
pub struct Archive {
    path: PathBuf,
    files: Vec<EntryData>,
    index: IndexMap<Box<str>, usize>,
    /// Offset of the central directory; where an appending session resumes.
    dir_start: u64,
    level: u32,
    session: Session,
}

impl Archive {
    /// Open the archive at `path`, reading its entry index.
    ///
    /// Damage is not an error here: an unreadable file or a container with no
    /// parseable central directory produces an empty archive, with the cause
    /// logged.
    pub fn open(path: impl AsRef<Path>) -> Archive {
        let path = path.as_ref().to_path_buf();
        let mut files = Vec::new();
        let mut index = IndexMap::new();
        let mut dir_start = 0;
        let mut handle = None;

        match File::open(&path) {
            Ok(mut file) => match read_central_directory(&mut file) {
                Ok(dir) => {
                    files = dir.files;
                    index = dir.index;
                    dir_start = dir.dir_start;
                    handle = Some(file);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "could not parse archive, starting empty"
                    );
                }
            },
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "archive not readable, starting empty"
                );
            }
        }

        Archive {
            path,
            files,
            index,
            dir_start,
            level: Compression::default().level(),
            session: Session::ReadOnly { file: handle },
        }
    }

    /// The path this archive was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, directory markers included.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the archive has no entries.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All entries in central-directory order. Duplicate names all appear.
    pub fn items(&self) -> impl Iterator<Item = Entry<'_>> {
        self.files.iter().map(move |data| Entry {
            archive: self,
            data,
        })
    }

    /// Find an entry by its exact stored name. When the archive holds
    /// duplicates of a name, the most recently added one is returned.
    pub fn lookup(&self, name: &str) -> Option<Entry<'_>> {
        self.index.get(name).map(|&i| Entry {
            archive: self,
            data: &self.files[i],
        })
    }

    /// Set the deflate level (clamped to 0 through 9) for subsequent adds.
    /// Level 0 stores entries uncompressed.
    pub fn set_level(&mut self, level: u32) -> &mut Self {
        self.level = level.min(9);
        self
    }

    /// Append an entry named `name` (normalized with [`sanitize_name`])
    /// holding `content`, stamped with the current time.
    pub fn add(&mut self, name: &str, content: impl AsRef<[u8]>) -> ZipResult<()> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return invalid_archive("Entry name is empty");
        }
        let last_modified = DateTime::try_from(SystemTime::now()).unwrap_or_default();
        let level = self.level;
        let writer = self.ensure_writer()?;
        let data = writer.add_entry(name.into(), last_modified, level, &mut content.as_ref())?;
        self.insert(data);
        Ok(())
    }

    /// Append the file at `src` under `name`. A `name` that is empty or ends
    /// in `/` gets the source file's own name appended, so `"docs/"` stores
    /// `docs/<basename>`. The entry keeps the source file's mtime.
    pub fn add_file(&mut self, name: &str, src: impl AsRef<Path>) -> ZipResult<()> {
        let src = src.as_ref();
        let mut name = sanitize_name(name);
        if name.is_empty() || name.ends_with('/') {
            let base = src
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or(ZipError::InvalidArchive(
                    "Source path has no usable file name".into(),
                ))?;
            name.push_str(base);
        }

        let mut file = File::open(src)?;
        let last_modified = file
            .metadata()?
            .modified()
            .ok()
            .and_then(|t| DateTime::try_from(t).ok())
            .unwrap_or_default();
        let level = self.level;
        let writer = self.ensure_writer()?;
        let data = writer.add_entry(name.into(), last_modified, level, &mut file)?;
        self.insert(data);
        Ok(())
    }

    /// Recursively add every file under `src`. With `add_root`, names are
    /// prefixed with `src`'s own directory name. A failure partway through
    /// leaves the entries added so far in place.
    pub fn pack(&mut self, src: impl AsRef<Path>, add_root: bool) -> ZipResult<()> {
        let src = src.as_ref();
        let prefix = if add_root {
            let base = src
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or(ZipError::InvalidArchive(
                    "Source directory has no usable name".into(),
                ))?;
            format!("{base}/")
        } else {
            String::new()
        };

        for dent in WalkDir::new(src).min_depth(1) {
            let dent = dent.map_err(io::Error::from)?;
            if !dent.file_type().is_file() {
                continue;
            }
            let rel = dent
                .path()
                .strip_prefix(src)
                .map_err(|_| ZipError::InvalidArchive("Walked outside the source root".into()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_str())
                .collect::<Option<Vec<_>>>()
                .ok_or(ZipError::InvalidArchive(
                    "File name is not valid UTF-8".into(),
                ))?
                .join("/");
            self.add_file(&format!("{prefix}{rel}"), dent.path())?;
        }
        Ok(())
    }

    /// Extract every entry under `dest`, creating `dest` itself if missing.
    ///
    /// Intermediate directories come from each entry's stored name; empty and
    /// `..` segments are dropped, so nothing is ever written outside `dest`.
    pub fn unpack(&self, dest: impl AsRef<Path>) -> ZipResult<()> {
        let dest = dest.as_ref();
        if !dest.exists() {
            fs::create_dir(dest)?;
        }

        for data in &self.files {
            let mut segments: Vec<&str> = safe_segments(&data.file_name).collect();
            let file_segment = if data.is_dir() { None } else { segments.pop() };

            let mut out_dir = dest.to_path_buf();
            out_dir.extend(&segments);
            fs::create_dir_all(&out_dir)?;

            match file_segment {
                Some(file_segment) => self.extract_data(data, &out_dir.join(file_segment))?,
                None if data.is_dir() => {}
                None => {
                    tracing::warn!(
                        name = &*data.file_name,
                        "entry name has no extractable file segment, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    /// Rewrite the central directory over every entry and close the write
    /// handle. A no-op for sessions that never added anything; idempotent.
    pub fn finalize(&mut self) -> ZipResult<()> {
        match mem::replace(&mut self.session, Session::Finalized) {
            Session::Appending { mut writer } => writer.finalize(&mut self.files),
            other => {
                self.session = other;
                Ok(())
            }
        }
    }

    fn insert(&mut self, data: EntryData) {
        let i = self.files.len();
        self.index.insert(data.file_name.clone(), i);
        self.files.push(data);
    }

    /// Switch into (or continue) an appending session.
    fn ensure_writer(&mut self) -> ZipResult<&mut ZipWriter<File>> {
        if matches!(self.session, Session::Finalized) {
            return Err(ZipError::ArchiveClosed);
        }

        if !matches!(self.session, Session::Appending { .. }) {
            // Release the read handle before reopening the path for writing.
            let _ = mem::replace(&mut self.session, Session::ReadOnly { file: None });

            // Read access stays necessary while appending, so entries
            // written earlier in the session remain readable.
            let writer = if self.files.is_empty() {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.path)?;
                ZipWriter::new(file)?
            } else {
                let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
                file.seek(SeekFrom::Start(self.dir_start))?;
                ZipWriter::new(file)?
            };
            self.session = Session::Appending { writer };
        }

        match self.session {
            Session::Appending { ref mut writer } => Ok(writer),
            _ => unreachable!("session was just set to Appending"),
        }
    }

    fn backing_file(&self) -> ZipResult<&File> {
        match &self.session {
            Session::ReadOnly { file: Some(file) } => Ok(file),
            Session::ReadOnly { file: None } => Err(ZipError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "archive has no backing file",
            ))),
            Session::Appending { writer } => Ok(writer.get_ref()),
            Session::Finalized => Err(ZipError::ArchiveClosed),
        }
    }

    fn extract_data(&self, data: &EntryData, out_path: &Path) -> ZipResult<()> {
        let mut backing = self.backing_file()?;
        let mut reader = make_entry_reader(data, &mut backing)?;
        let mut out = File::create(out_path)?;
        io::copy(&mut reader, &mut out)?;
        if let Some(mtime) = data.last_modified_time.to_system_time() {
            out.set_modified(mtime)?;
        }
        Ok(())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to finalize archive on drop"
            );
        }
    }
}

/// A view of one archive entry.
pub struct Entry<'a> {
    archive: &'a Archive,
    data: &'a EntryData,
}

impl Entry<'_> {
    /// The stored, `/`-separated name.
    pub fn name(&self) -> &str {
        &self.data.file_name
    }

    /// Uncompressed size in bytes.
    pub fn size(&self) -> u64 {
        self.data.uncompressed_size
    }

    /// Size of the entry's bytes as stored in the container.
    pub fn compressed_size(&self) -> u64 {
        self.data.compressed_size
    }

    /// Last-modified timestamp recorded for the entry.
    pub fn last_modified(&self) -> DateTime {
        self.data.last_modified_time
    }

    /// How the entry's bytes are stored in the container.
    pub fn compression(&self) -> CompressionMethod {
        self.data.compression_method
    }

    /// Whether this is a directory marker (name ends in `/`).
    pub fn is_dir(&self) -> bool {
        self.data.is_dir()
    }

    /// Decompress the entry into memory, verifying its checksum.
    pub fn content(&self) -> ZipResult<Vec<u8>> {
        let mut backing = self.archive.backing_file()?;
        read_entry_bytes(self.data, &mut backing)
    }

    /// The entry decoded as text. Invalid UTF-8 is replaced, not rejected.
    pub fn text(&self) -> ZipResult<String> {
        let bytes = self.content()?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    /// Extract into `dest_dir/<basename>`, restoring the recorded mtime.
    /// `dest_dir` must already exist.
    pub fn extract(&self, dest_dir: impl AsRef<Path>) -> ZipResult<()> {
        let base = base_name(&self.data.file_name);
        if base.is_empty() || base == ".." {
            return invalid_archive("Entry has no extractable file name");
        }
        self.archive
            .extract_data(self.data, &dest_dir.as_ref().join(base))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path().join("nope.zip"));
        assert!(archive.is_empty());
        assert_eq!(archive.len(), 0);
        assert!(archive.lookup("anything").is_none());
    }

    #[test]
    fn open_garbage_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.zip");
        fs::write(&path, b"this is not a zip file, not even close").unwrap();
        let archive = Archive::open(&path);
        assert!(archive.is_empty());
    }

    #[test]
    fn level_clamps_to_nine() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path().join("a.zip"));
        archive.set_level(200);
        assert_eq!(archive.level, 9);
        archive.set_level(0);
        assert_eq!(archive.level, 0);
    }

    #[test]
    fn add_after_finalize_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path().join("a.zip"));
        archive.add("one.txt", "hello").unwrap();
        archive.finalize().unwrap();
        let err = archive.add("two.txt", "world").unwrap_err();
        assert!(matches!(err, ZipError::ArchiveClosed));
    }

    #[test]
    fn failed_write_open_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("a.zip");
        let mut archive = Archive::open(&path);

        // The parent directory does not exist, so switching into an
        // appending session fails with a plain i/o error.
        let err = archive.add("a.txt", "a").unwrap_err();
        assert!(matches!(err, ZipError::Io(_)));

        // The session did not transition; once the parent exists the
        // same archive accepts the retried add.
        fs::create_dir(dir.path().join("missing")).unwrap();
        archive.add("a.txt", "a").unwrap();
        archive.finalize().unwrap();

        let archive = Archive::open(&path);
        assert_eq!(archive.lookup("a.txt").unwrap().text().unwrap(), "a");
    }

    #[test]
    fn finalize_without_adds_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path().join("a.zip"));
        archive.finalize().unwrap();
        archive.finalize().unwrap();
        // No container should have been created on disk.
        assert!(!dir.path().join("a.zip").exists());
    }

    #[test]
    fn names_are_sanitized_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        {
            let mut archive = Archive::open(&path);
            archive.add("\\windows\\style.txt", "x").unwrap();
            archive.add("/rooted.txt", "y").unwrap();
        }
        let archive = Archive::open(&path);
        assert!(archive.lookup("windows/style.txt").is_some());
        assert!(archive.lookup("rooted.txt").is_some());
        assert!(archive.lookup("/rooted.txt").is_none());
    }

    #[test]
    fn duplicate_names_last_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        {
            let mut archive = Archive::open(&path);
            archive.add("same.txt", "old").unwrap();
            archive.add("same.txt", "new").unwrap();
        }
        let archive = Archive::open(&path);
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.lookup("same.txt").unwrap().text().unwrap(), "new");
    }

    #[test]
    fn entries_readable_while_appending() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = Archive::open(dir.path().join("a.zip"));
        archive.add("first.txt", "first body").unwrap();
        // Still appending; the entry just written must already be readable.
        assert_eq!(
            archive.lookup("first.txt").unwrap().text().unwrap(),
            "first body"
        );
        archive.add("second.txt", "second body").unwrap();
        assert_eq!(
            archive.lookup("second.txt").unwrap().text().unwrap(),
            "second body"
        );
    }
}
