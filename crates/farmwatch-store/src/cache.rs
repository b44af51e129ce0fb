use crate::StoreError;
use farmwatch_core::coerce::decode_line_bytes;
use farmwatch_core::StoredRecord;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::debug;

/// What a load does when the backing file does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    Empty,
    Fail,
}

/// Identity of one on-disk version of a file.
///
/// `None` stands for "file absent" under [`MissingPolicy::Empty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

struct CacheEntry<T> {
    generation: Option<Generation>,
    records: Arc<Vec<T>>,
}

/// Decoded contents of one JSONL file, re-read only when its generation changes.
pub struct FileCache<T> {
    path: PathBuf,
    source: String,
    policy: MissingPolicy,
    entry: Mutex<Option<CacheEntry<T>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StoredRecord> FileCache<T> {
    pub fn new(path: impl Into<PathBuf>, policy: MissingPolicy) -> Self {
        let path = path.into();
        let source = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| T::KIND.file_name().to_string());
        Self {
            path,
            source,
            policy,
            entry: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Arc<Vec<T>>, StoreError> {
        self.load_with_generation().map(|(records, _)| records)
    }

    pub fn load_with_generation(
        &self,
    ) -> Result<(Arc<Vec<T>>, Option<Generation>), StoreError> {
        let generation = self.stat()?;

        let mut guard = self
            .entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = guard.as_ref() {
            if entry.generation == generation {
                debug!(
                    event = "cache_hit",
                    path = %self.path.display(),
                    records = entry.records.len()
                );
                return Ok((Arc::clone(&entry.records), generation));
            }
        }

        let records = match generation {
            Some(_) => Arc::new(self.read_records()?),
            None => Arc::new(Vec::new()),
        };
        debug!(
            event = "cache_reload",
            path = %self.path.display(),
            records = records.len()
        );
        *guard = Some(CacheEntry {
            generation,
            records: Arc::clone(&records),
        });
        Ok((records, generation))
    }

    fn stat(&self) -> Result<Option<Generation>, StoreError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(Generation {
                modified: meta.modified().ok(),
                len: meta.len(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => match self.policy {
                MissingPolicy::Empty => Ok(None),
                MissingPolicy::Fail => Err(StoreError::Missing {
                    path: self.path.clone(),
                }),
            },
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn read_records(&self) -> Result<Vec<T>, StoreError> {
        let content = std::fs::read(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for (idx, line) in content.split(|byte| *byte == b'\n').enumerate() {
            let line = trim_ascii(line);
            if line.is_empty() {
                continue;
            }
            let record = decode_line_bytes(T::KIND, line, &self.source).map_err(|source| {
                StoreError::Corrupt {
                    path: self.path.clone(),
                    line: idx + 1,
                    source,
                }
            })?;
            if let Some(record) = T::from_record(record) {
                records.push(record);
            }
        }
        Ok(T::finalize(records))
    }
}

fn trim_ascii(mut line: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = line {
        if !first.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    while let [rest @ .., last] = line {
        if !last.is_ascii_whitespace() {
            break;
        }
        line = rest;
    }
    line
}
