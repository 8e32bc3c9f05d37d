//! Recording storage backends
//!
//! A `StorageBackend` is chosen once when a recording starts and opens one
//! `RecordingSink`. The sink lives for the whole recording (stream switches
//! keep writing into it) and is consumed exactly once, by `finalize` or
//! `discard`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::recording::{DEFAULT_SUBDIR, WRITE_BUFFER_SIZE};
use crate::error::{RadioError, Result};

/// A finished recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecording {
    /// Human-readable location shown to the user
    pub location: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Destination of one recording
pub trait RecordingSink: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Where the recording will end up
    fn location(&self) -> String;

    fn bytes_written(&self) -> u64;

    /// Flush, close and publish the recording
    fn finalize(self: Box<Self>) -> Result<SavedRecording>;

    /// Close and remove every trace of the recording
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Factory for sinks
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, file_name: &str, mime_type: &str) -> Result<Box<dyn RecordingSink>>;
}

// =============================================================================
// Filesystem helpers
// =============================================================================

fn create_dir_if_needed(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| {
        RadioError::Storage(match e.kind() {
            ErrorKind::PermissionDenied => {
                format!("Permission denied: cannot create directory {:?}", path)
            }
            _ => format!("Failed to create directory {:?}: {}", path, e),
        })
    })
}

fn create_new_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn open_error(path: &Path, e: std::io::Error) -> RadioError {
    RadioError::Storage(match e.kind() {
        ErrorKind::PermissionDenied => format!("Permission denied: cannot write to {:?}", path),
        ErrorKind::NotFound => format!("Cannot write to {:?}: directory does not exist", path),
        ErrorKind::ReadOnlyFilesystem => {
            format!("Cannot write to {:?}: filesystem is read-only", path)
        }
        _ => format!("Failed to create {:?}: {}", path, e),
    })
}

/// Create `dir/file_name`, or `name (1).ext`, `name (2).ext`, ... if taken
fn create_unique(dir: &Path, file_name: &str) -> Result<(PathBuf, File)> {
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (file_name, None),
    };

    for n in 0u32..1000 {
        let candidate = match (n, ext) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{stem} ({n}).{ext}"),
            (n, None) => format!("{stem} ({n})"),
        };
        let path = dir.join(candidate);
        match create_new_file(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(open_error(&path, e)),
        }
    }
    Err(RadioError::Storage(format!(
        "Too many recordings named {file_name:?} in {:?}",
        dir
    )))
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RadioError::Storage(format!("Failed to delete {:?}: {}", path, e))),
    }
}

/// Buffered file shared by all backends
struct FileWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl FileWriter {
    fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            written: 0,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| RadioError::RecordingWrite(format!("{:?}: {}", self.path, e)))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| RadioError::RecordingWrite(format!("{:?}: {}", self.path, e)))
    }

    /// Flush and close, returning the path and size
    fn close(mut self) -> Result<(PathBuf, u64)> {
        self.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| RadioError::RecordingWrite(e.to_string()))?;
        file.sync_all()?;
        Ok((self.path, self.written))
    }

    fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.writer);
        remove_file_if_exists(&path)
    }
}

/// Sink writing straight to its final path
struct PlainFileSink {
    file: FileWriter,
}

impl RecordingSink for PlainFileSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn location(&self) -> String {
        self.file.path.display().to_string()
    }

    fn bytes_written(&self) -> u64 {
        self.file.written
    }

    fn finalize(self: Box<Self>) -> Result<SavedRecording> {
        let (path, size_bytes) = self.file.close()?;
        info!(path = %path.display(), size_bytes, "Recording saved");
        Ok(SavedRecording {
            location: path.display().to_string(),
            path,
            size_bytes,
        })
    }

    fn discard(self: Box<Self>) -> Result<()> {
        debug!(path = %self.file.path.display(), "Discarding recording");
        self.file.remove()
    }
}

// =============================================================================
// FileStorage
// =============================================================================

/// Recordings in a fixed directory, created on demand
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<music dir>/umbra`, falling back to `~/Music/umbra`
    pub fn default_location() -> Result<Self> {
        dirs::audio_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join("Music")))
            .map(|d| Self::new(d.join(DEFAULT_SUBDIR)))
            .ok_or_else(|| {
                RadioError::Storage("Could not determine a music directory".to_string())
            })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StorageBackend for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, file_name: &str, _mime_type: &str) -> Result<Box<dyn RecordingSink>> {
        create_dir_if_needed(&self.dir)?;
        let (path, file) = create_unique(&self.dir, file_name)?;
        debug!(path = %path.display(), "Opened recording file");
        Ok(Box::new(PlainFileSink {
            file: FileWriter::new(path, file),
        }))
    }
}

// =============================================================================
// DirectoryStorage
// =============================================================================

/// Recordings in a directory picked by the user. The directory must already
/// exist and is never created.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl StorageBackend for DirectoryStorage {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn open(&self, file_name: &str, _mime_type: &str) -> Result<Box<dyn RecordingSink>> {
        if !self.dir.is_dir() {
            return Err(RadioError::Storage(format!(
                "Recording directory {:?} is not available",
                self.dir
            )));
        }
        let (path, file) = create_unique(&self.dir, file_name)?;
        Ok(Box::new(PlainFileSink {
            file: FileWriter::new(path, file),
        }))
    }
}

// =============================================================================
// MediaIndexStorage
// =============================================================================

const INDEX_FILE: &str = "index.json";
const PENDING_PREFIX: &str = ".pending-";

/// One entry of a media library index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEntry {
    pub id: u64,
    pub display_name: String,
    pub mime_type: String,
    /// File name relative to the library root
    pub file_name: String,
    /// Still being written; hidden from library listings
    pub pending: bool,
    #[serde(default)]
    pub size_bytes: u64,
    pub added_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MediaIndex {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    entries: Vec<MediaEntry>,
}

/// A media library: audio files under a root plus an `index.json` catalog.
///
/// Entries are inserted as pending while recording, then published (file
/// renamed into place, size recorded) or removed.
#[derive(Debug, Clone)]
pub struct MediaIndexStorage {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl MediaIndexStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Published (non-pending) entries
    pub fn entries(&self) -> Result<Vec<MediaEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(read_index(&self.root)?
            .entries
            .into_iter()
            .filter(|e| !e.pending)
            .collect())
    }

    /// All entries, pending ones included
    pub fn all_entries(&self) -> Result<Vec<MediaEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(read_index(&self.root)?.entries)
    }

    fn update<T>(&self, f: impl FnOnce(&mut MediaIndex) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = read_index(&self.root)?;
        let out = f(&mut index);
        write_index(&self.root, &index)?;
        Ok(out)
    }
}

fn read_index(root: &Path) -> Result<MediaIndex> {
    let path = root.join(INDEX_FILE);
    match fs::read_to_string(&path) {
        Ok(content) if content.trim().is_empty() => Ok(MediaIndex::default()),
        Ok(content) => serde_json::from_str(&content)
            .map_err(|e| RadioError::Storage(format!("Failed to parse {:?}: {}", path, e))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(MediaIndex::default()),
        Err(e) => Err(RadioError::Storage(format!("Failed to read {:?}: {}", path, e))),
    }
}

fn write_index(root: &Path, index: &MediaIndex) -> Result<()> {
    let path = root.join(INDEX_FILE);
    let content = serde_json::to_string_pretty(index)
        .map_err(|e| RadioError::Storage(format!("Failed to serialize media index: {}", e)))?;
    fs::write(&path, content).map_err(|e| open_error(&path, e))
}

impl StorageBackend for MediaIndexStorage {
    fn name(&self) -> &'static str {
        "media-index"
    }

    fn open(&self, file_name: &str, mime_type: &str) -> Result<Box<dyn RecordingSink>> {
        create_dir_if_needed(&self.root)?;
        let (path, file) = create_unique(&self.root, &format!("{PENDING_PREFIX}{file_name}"))?;
        let staged = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let final_name = staged
            .strip_prefix(PENDING_PREFIX)
            .unwrap_or(&staged)
            .to_string();

        let inserted = self.update(|index| {
            index.next_id += 1;
            let id = index.next_id;
            index.entries.push(MediaEntry {
                id,
                display_name: final_name.clone(),
                mime_type: mime_type.to_string(),
                file_name: staged.clone(),
                pending: true,
                size_bytes: 0,
                added_at: Local::now().to_rfc3339(),
            });
            id
        });
        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                drop(file);
                let _ = remove_file_if_exists(&path);
                return Err(e);
            }
        };

        debug!(id, path = %path.display(), "Inserted pending media entry");
        Ok(Box::new(MediaIndexSink {
            storage: self.clone(),
            id,
            final_name,
            file: FileWriter::new(path, file),
        }))
    }
}

struct MediaIndexSink {
    storage: MediaIndexStorage,
    id: u64,
    final_name: String,
    file: FileWriter,
}

impl RecordingSink for MediaIndexSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn location(&self) -> String {
        format!("media library: {}", self.final_name)
    }

    fn bytes_written(&self) -> u64 {
        self.file.written
    }

    fn finalize(self: Box<Self>) -> Result<SavedRecording> {
        let MediaIndexSink {
            storage,
            id,
            final_name,
            file,
        } = *self;
        let (staged, size_bytes) = file.close()?;

        let (final_name, target) = match storage.root.join(&final_name) {
            p if p.exists() => {
                // Taken since the recording started; keep the next free name
                let (p, f) = create_unique(&storage.root, &final_name)?;
                drop(f);
                let name = p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or(final_name);
                (name, p)
            }
            p => (final_name, p),
        };
        fs::rename(&staged, &target).map_err(|e| {
            RadioError::Storage(format!("Failed to publish {:?}: {}", target, e))
        })?;

        storage.update(|index| {
            if let Some(entry) = index.entries.iter_mut().find(|e| e.id == id) {
                entry.pending = false;
                entry.size_bytes = size_bytes;
                entry.file_name = final_name.clone();
                entry.display_name = final_name.clone();
            }
        })?;

        info!(id, path = %target.display(), size_bytes, "Recording published to media library");
        Ok(SavedRecording {
            location: format!("media library: {final_name}"),
            path: target,
            size_bytes,
        })
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let MediaIndexSink {
            storage, id, file, ..
        } = *self;
        let removed = file.remove();
        let updated = storage.update(|index| index.entries.retain(|e| e.id != id));
        if let Err(e) = &updated {
            warn!(id, error = %e, "Failed to remove pending media entry");
        }
        removed.and(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    // --- FileStorage ---

    #[test]
    fn file_storage_creates_directory_and_saves() {
        let tmp = tempdir().unwrap();
        let storage = FileStorage::new(tmp.path().join("music").join("umbra"));

        let mut sink = storage.open("Station_20240101_000000.mp3", "audio/mpeg").unwrap();
        sink.write(b"abc").unwrap();
        sink.write(b"def").unwrap();
        assert_eq!(sink.bytes_written(), 6);
        let saved = sink.finalize().unwrap();

        assert_eq!(saved.size_bytes, 6);
        assert_eq!(fs::read(&saved.path).unwrap(), b"abcdef");
        assert!(saved.path.starts_with(storage.dir()));
    }

    #[test]
    fn file_storage_discard_leaves_nothing() {
        let tmp = tempdir().unwrap();
        let storage = FileStorage::new(tmp.path());
        let sink = storage.open("empty.mp3", "audio/mpeg").unwrap();
        sink.discard().unwrap();
        assert!(files_in(tmp.path()).is_empty());
    }

    // --- DirectoryStorage ---

    #[test]
    fn directory_storage_requires_existing_directory() {
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("gone");
        let storage = DirectoryStorage::new(&missing);
        assert!(matches!(
            storage.open("a.mp3", "audio/mpeg"),
            Err(RadioError::Storage(_))
        ));
        assert!(!missing.exists(), "never created");
    }

    #[test]
    fn directory_storage_resolves_name_collisions() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("show.ogg"), b"old").unwrap();
        let storage = DirectoryStorage::new(tmp.path());

        let mut first = storage.open("show.ogg", "audio/ogg").unwrap();
        first.write(b"1").unwrap();
        let first = first.finalize().unwrap();
        let mut second = storage.open("show.ogg", "audio/ogg").unwrap();
        second.write(b"2").unwrap();
        let second = second.finalize().unwrap();

        assert!(first.path.ends_with("show (1).ogg"));
        assert!(second.path.ends_with("show (2).ogg"));
        assert_eq!(fs::read(tmp.path().join("show.ogg")).unwrap(), b"old");
    }

    #[test]
    fn directory_storage_discard_leaves_nothing() {
        let tmp = tempdir().unwrap();
        let storage = DirectoryStorage::new(tmp.path());
        let sink = storage.open("x.mp3", "audio/mpeg").unwrap();
        sink.discard().unwrap();
        assert!(files_in(tmp.path()).is_empty());
    }

    // --- MediaIndexStorage ---

    #[test]
    fn media_index_entry_is_pending_until_finalized() {
        let tmp = tempdir().unwrap();
        let storage = MediaIndexStorage::new(tmp.path());

        let mut sink = storage.open("Jazz_20240101_120000.aac", "audio/aac").unwrap();
        sink.write(&[7u8; 100]).unwrap();

        let all = storage.all_entries().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].pending);
        assert!(storage.entries().unwrap().is_empty());

        let saved = sink.finalize().unwrap();
        assert_eq!(saved.size_bytes, 100);
        assert!(saved.path.ends_with("Jazz_20240101_120000.aac"));

        let published = storage.entries().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].size_bytes, 100);
        assert_eq!(published[0].mime_type, "audio/aac");
        assert_eq!(published[0].file_name, "Jazz_20240101_120000.aac");
        assert!(!files_in(tmp.path()).iter().any(|n| n.starts_with(PENDING_PREFIX)));
    }

    #[test]
    fn media_index_discard_removes_entry_and_file() {
        let tmp = tempdir().unwrap();
        let storage = MediaIndexStorage::new(tmp.path());
        let sink = storage.open("x.mp3", "audio/mpeg").unwrap();
        sink.discard().unwrap();

        assert!(storage.all_entries().unwrap().is_empty());
        assert_eq!(files_in(tmp.path()), vec![INDEX_FILE.to_string()]);
    }

    #[test]
    fn media_index_ids_are_unique() {
        let tmp = tempdir().unwrap();
        let storage = MediaIndexStorage::new(tmp.path());
        let a = storage.open("a.mp3", "audio/mpeg").unwrap();
        let b = storage.open("b.mp3", "audio/mpeg").unwrap();
        let ids: Vec<u64> = storage.all_entries().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
        a.discard().unwrap();
        b.discard().unwrap();
    }
}
