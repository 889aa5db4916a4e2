/*
 * Copyright 2020 Joyent, Inc.
 */

//! Bounded cache of open file handles for reader plugins.
//!
//! Entries are keyed on `(reader type, path)`. Closing an entry keeps it in
//! the table so a later open of the same pair reuses the slot; when the table
//! is full the least recently used closed entry is evicted, or failing that
//! the least recently used entry of all. Native open and close calls are made
//! through the [`FileReader`] registered for the entry's reader type.

use std::any::Any;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use slog::{debug, o, warn, Drain, Logger};

pub const DEFAULT_CAPACITY: usize = 50;

/// Reader type used when a plugin reads plain files.
pub const PLAIN_READER: &str = "plain";

pub type NativeHandle = Box<dyn Any + Send + Sync>;

pub trait FileReader: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<NativeHandle>;
    fn close(&self, handle: NativeHandle) -> io::Result<()>;
}

/// Opens paths as `std::fs::File`.
pub struct PlainFileReader;

impl FileReader for PlainFileReader {
    fn open(&self, path: &Path) -> io::Result<NativeHandle> {
        Ok(Box::new(File::open(path)?))
    }

    fn close(&self, handle: NativeHandle) -> io::Result<()> {
        drop(handle);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Open,
    Closed,
}

struct CachedFile {
    reader: String,
    path: PathBuf,
    handle: Option<NativeHandle>,
    last_used: u64,
}

impl CachedFile {
    fn status(&self) -> FileStatus {
        if self.handle.is_some() {
            FileStatus::Open
        } else {
            FileStatus::Closed
        }
    }
}

pub struct FileCache {
    capacity: usize,
    entries: Vec<CachedFile>,
    readers: HashMap<String, Box<dyn FileReader>>,
    clock: u64,
    log: Logger,
}

impl FileCache {
    pub fn new(capacity: usize, log: Option<&Logger>) -> FileCache {
        let log = log.cloned().unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });
        let mut readers: HashMap<String, Box<dyn FileReader>> =
            HashMap::new();
        readers.insert(PLAIN_READER.to_string(), Box::new(PlainFileReader));

        FileCache {
            capacity: capacity.max(1),
            entries: Vec::new(),
            readers,
            clock: 0,
            log: log.new(o!("component" => "file_cache")),
        }
    }

    pub fn register_reader(&mut self, reader: &str, imp: Box<dyn FileReader>) {
        self.readers.insert(reader.to_string(), imp);
    }

    /// Return the open handle for `(reader, path)`, opening it if needed.
    pub fn open(
        &mut self,
        reader: &str,
        path: &Path,
    ) -> io::Result<&mut (dyn Any + Send + Sync)> {
        self.clock += 1;
        let now = self.clock;

        let idx = match self.position(reader, path) {
            Some(idx) => {
                if self.entries[idx].handle.is_none() {
                    debug!(self.log, "reopening cached file";
                        "path" => %path.display());
                    let handle = self.native_open(reader, path)?;
                    self.entries[idx].handle = Some(handle);
                }
                idx
            }
            None => {
                let handle = self.native_open(reader, path)?;
                if self.entries.len() >= self.capacity {
                    self.evict();
                }
                self.entries.push(CachedFile {
                    reader: reader.to_string(),
                    path: path.to_path_buf(),
                    handle: Some(handle),
                    last_used: now,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[idx];
        entry.last_used = now;
        match entry.handle.as_mut() {
            Some(handle) => Ok(&mut **handle),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "cached file has no open handle",
            )),
        }
    }

    /// Typed convenience over [`FileCache::open`].
    pub fn open_as<T: Any>(
        &mut self,
        reader: &str,
        path: &Path,
    ) -> io::Result<&mut T> {
        self.open(reader, path)?.downcast_mut::<T>().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("reader {} does not produce this handle type", reader),
            )
        })
    }

    /// Close every entry for `path`. The entries stay cached as closed.
    pub fn close(&mut self, path: &Path) -> io::Result<()> {
        let mut result = Ok(());
        for idx in 0..self.entries.len() {
            if self.entries[idx].path == path {
                if let Err(e) = self.close_entry(idx) {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Close and forget every entry.
    pub fn close_all(&mut self) {
        for idx in 0..self.entries.len() {
            if let Err(e) = self.close_entry(idx) {
                warn!(self.log, "failed to close cached file";
                    "path" => %self.entries[idx].path.display(),
                    "error" => %e);
            }
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn status(&self, reader: &str, path: &Path) -> Option<FileStatus> {
        self.position(reader, path)
            .map(|idx| self.entries[idx].status())
    }

    fn position(&self, reader: &str, path: &Path) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.reader == reader && e.path == path)
    }

    fn native_open(
        &self,
        reader: &str,
        path: &Path,
    ) -> io::Result<NativeHandle> {
        match self.readers.get(reader) {
            Some(imp) => imp.open(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no file reader registered for {}", reader),
            )),
        }
    }

    fn close_entry(&mut self, idx: usize) -> io::Result<()> {
        let entry = &mut self.entries[idx];
        match entry.handle.take() {
            Some(handle) => match self.readers.get(&entry.reader) {
                Some(imp) => imp.close(handle),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn evict(&mut self) {
        let oldest_closed = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status() == FileStatus::Closed)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(idx, _)| idx);
        let victim = oldest_closed.or_else(|| {
            self.entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(idx, _)| idx)
        });

        if let Some(idx) = victim {
            if let Err(e) = self.close_entry(idx) {
                warn!(self.log, "failed to close evicted file";
                    "path" => %self.entries[idx].path.display(),
                    "error" => %e);
            }
            let evicted = self.entries.remove(idx);
            debug!(self.log, "evicted cached file";
                "path" => %evicted.path.display());
        }
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::TempDir;

    struct CountingReader {
        closes: Arc<AtomicUsize>,
    }

    impl FileReader for CountingReader {
        fn open(&self, path: &Path) -> io::Result<NativeHandle> {
            Ok(Box::new(path.to_path_buf()))
        }

        fn close(&self, _handle: NativeHandle) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_cache(capacity: usize) -> (FileCache, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut cache = FileCache::new(capacity, None);
        cache.register_reader(
            "count",
            Box::new(CountingReader {
                closes: Arc::clone(&closes),
            }),
        );
        (cache, closes)
    }

    #[test]
    fn reopening_an_open_entry_reuses_it() {
        let (mut cache, closes) = counting_cache(4);
        cache.open("count", Path::new("/a")).unwrap();
        cache.open("count", Path::new("/a")).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn closed_entries_are_reopened_in_place() {
        let (mut cache, closes) = counting_cache(4);
        cache.open("count", Path::new("/a")).unwrap();
        cache.close(Path::new("/a")).unwrap();
        assert_eq!(
            cache.status("count", Path::new("/a")),
            Some(FileStatus::Closed)
        );
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        cache.open("count", Path::new("/a")).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.status("count", Path::new("/a")),
            Some(FileStatus::Open)
        );
    }

    #[test]
    fn eviction_prefers_oldest_closed_entry() {
        let (mut cache, _closes) = counting_cache(3);
        cache.open("count", Path::new("/a")).unwrap();
        cache.open("count", Path::new("/b")).unwrap();
        cache.open("count", Path::new("/c")).unwrap();
        cache.close(Path::new("/b")).unwrap();
        cache.open("count", Path::new("/a")).unwrap();

        cache.open("count", Path::new("/d")).unwrap();

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.status("count", Path::new("/b")), None);
        assert!(cache.status("count", Path::new("/a")).is_some());
        assert!(cache.status("count", Path::new("/c")).is_some());
    }

    #[test]
    fn eviction_falls_back_to_oldest_open_entry() {
        let (mut cache, closes) = counting_cache(2);
        cache.open("count", Path::new("/a")).unwrap();
        cache.open("count", Path::new("/b")).unwrap();
        cache.open("count", Path::new("/a")).unwrap();

        cache.open("count", Path::new("/c")).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.status("count", Path::new("/b")), None);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn same_path_under_different_readers_is_two_entries() {
        let (mut cache, _closes) = counting_cache(4);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shot.dat");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        cache.open_as::<File>(PLAIN_READER, &path).unwrap();
        cache.open("count", &path).unwrap();
        assert_eq!(cache.len(), 2);

        cache.close_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_files_report_the_os_error() {
        let mut cache = FileCache::new(2, None);
        let dir = TempDir::new().unwrap();
        let err = cache
            .open(PLAIN_READER, &dir.path().join("absent"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(cache.is_empty());
    }
}
