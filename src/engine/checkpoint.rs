//! Memoization of checkpointed tasks.
//!
//! A checkpointed invocation is keyed by a BLAKE3 fingerprint of its body
//! name and resolved arguments. Files are fingerprinted by content, so moving
//! an input file does not invalidate the entry while editing it does.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::CheckpointError;
use crate::value::Value;

/// Where checkpointed outputs are kept.
pub trait CheckpointStore: Send + Sync {
    fn lookup(&self, key: &Hash32) -> Option<Vec<Value>>;
    fn store(&self, key: Hash32, outputs: Vec<Value>) -> Result<(), CheckpointError>;

    fn flush(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// When [`FileCheckpoints`] pushes entries to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// After every stored entry.
    Always,
    /// At the end of each run and when the store is dropped.
    #[default]
    OnClose,
}

pub fn fingerprint(body: &str, args: &[Value]) -> Result<Hash32, CheckpointError> {
    let mut hasher = Blake3Hasher::default();
    hasher.update(body.as_bytes()).update(&[0]);

    let mut buffer = Vec::new();
    for arg in args {
        buffer.clear();
        match arg {
            Value::File(path) => {
                let content = Hash32::hash_file(path)?;
                ciborium::into_writer(&("file", content), &mut buffer)?;
            }
            other => ciborium::into_writer(other, &mut buffer)?,
        }
        hasher.update(&buffer);
    }

    Ok(hasher.into())
}

/// Fingerprints whose body is running right now.
///
/// A task whose fingerprint is claimed by another one blocks on its rank
/// until that task is done, then looks the store up again. Identical
/// invocations in one run therefore execute the body once.
#[derive(Default)]
pub(crate) struct InFlight {
    keys: Mutex<HashSet<Hash32>>,
    released: Condvar,
}

impl InFlight {
    pub(crate) fn claim(&self, key: Hash32) -> Claim<'_> {
        let mut keys = self.keys.lock();
        if keys.contains(&key) {
            tracing::debug!(key = %key.to_hex(), "waiting for a running task with the same fingerprint");
        }
        while keys.contains(&key) {
            self.released.wait(&mut keys);
        }
        keys.insert(key);
        Claim { owner: self, key }
    }
}

pub(crate) struct Claim<'a> {
    owner: &'a InFlight,
    key: Hash32,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.owner.keys.lock().remove(&self.key);
        self.owner.released.notify_all();
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    entries: Mutex<HashMap<Hash32, Vec<Value>>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn lookup(&self, key: &Hash32) -> Option<Vec<Value>> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: Hash32, outputs: Vec<Value>) -> Result<(), CheckpointError> {
        self.entries.lock().insert(key, outputs);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Entry {
    key: Hash32,
    outputs: Vec<Value>,
}

/// Append-only CBOR log of checkpoint entries, replayed on open.
pub struct FileCheckpoints {
    path: Utf8PathBuf,
    policy: FlushPolicy,
    entries: Mutex<HashMap<Hash32, Vec<Value>>>,
    writer: Mutex<BufWriter<File>>,
}

impl FileCheckpoints {
    pub fn open(path: impl AsRef<Utf8Path>, policy: FlushPolicy) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_owned();
        let entries = match File::open(&path) {
            Ok(file) => Self::replay(file)?,
            Err(err) if err.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(%path, entries = entries.len(), "opened checkpoint log");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            policy,
            entries: Mutex::new(entries),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn replay(file: File) -> Result<HashMap<Hash32, Vec<Value>>, CheckpointError> {
        let mut reader = BufReader::new(file);
        let mut entries = HashMap::new();
        loop {
            match ciborium::from_reader::<Entry, _>(&mut reader) {
                Ok(entry) => {
                    entries.insert(entry.key, entry.outputs);
                }
                Err(ciborium::de::Error::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(entries)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CheckpointStore for FileCheckpoints {
    fn lookup(&self, key: &Hash32) -> Option<Vec<Value>> {
        self.entries.lock().get(key).cloned()
    }

    fn store(&self, key: Hash32, outputs: Vec<Value>) -> Result<(), CheckpointError> {
        let entry = Entry { key, outputs };
        {
            let mut writer = self.writer.lock();
            ciborium::into_writer(&entry, &mut *writer)?;
            if self.policy == FlushPolicy::Always {
                writer.flush()?;
            }
        }
        self.entries.lock().insert(entry.key, entry.outputs);
        Ok(())
    }

    fn flush(&self) -> Result<(), CheckpointError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileCheckpoints {
    fn drop(&mut self) {
        if let Err(err) = self.writer.get_mut().flush() {
            tracing::error!(path = %self.path, "failed to flush checkpoint log: {err}");
        }
    }
}
