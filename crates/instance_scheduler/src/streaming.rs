//! Streaming reader for model data.
//!
//! Serves byte-range reads against backing stores (in-memory bulk data, files
//! on disk, content-addressed blobs) with one async contract:
//!
//! ```text
//! prepare_streaming(source, store)
//!        │
//!        ▼
//! begin_read(source, key, size) ──► rayon worker ──► store.read()
//!        │                                               │
//!        ▼                                               ▼
//! poll(id) / end_read(id) ◄─────────── completion channel + callback
//! ```
//!
//! Every `begin_read` is matched by exactly one `end_read`; ids are never
//! reused. Cancelling a source drains its outstanding reads before the
//! source state is discarded.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{self as channel, Receiver, TryRecvError};

use crate::error::StreamError;
use crate::threading::lock;

/// Identifier of a streaming source (one per compiled model).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u32);

/// Key of a data block inside a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(pub u32);

/// Identifier of an outstanding read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
  pub fn raw(&self) -> u64 {
    self.0
  }
}

/// Where a block lives inside a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLocation {
  /// File id, or content hash for content-addressed stores.
  pub file: u64,
  pub offset: u64,
  pub size: usize,
}

/// Completion callback, invoked with `true` when the read succeeded.
pub type ReadCallback = Box<dyn FnOnce(bool) + Send>;

/// Byte-addressable storage behind a source.
pub trait BackingStore: Send + Sync {
  /// False when the store holds nothing worth streaming.
  fn has_data(&self) -> bool;

  /// False once the owner of the store has gone away.
  fn is_alive(&self) -> bool {
    true
  }

  fn locate(&self, key: BlockKey) -> Option<BlockLocation>;

  /// Fill `buf` from `location`. Must read exactly `buf.len()` bytes.
  fn read(&self, location: &BlockLocation, buf: &mut [u8]) -> io::Result<()>;
}

fn read_slice(data: &[u8], location: &BlockLocation, buf: &mut [u8]) -> io::Result<()> {
  let start = location.offset as usize;
  let end = start + buf.len();
  let bytes = data
    .get(start..end)
    .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of block data"))?;
  buf.copy_from_slice(bytes);
  Ok(())
}

// =============================================================================
// Backing stores
// =============================================================================

/// Bulk data held in memory.
#[derive(Default)]
pub struct MemoryStore {
  files: HashMap<u64, Arc<[u8]>>,
  blocks: HashMap<BlockKey, BlockLocation>,
  closed: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a whole file of bulk data.
  pub fn add_file(&mut self, file: u64, data: impl Into<Arc<[u8]>>) {
    self.files.insert(file, data.into());
  }

  pub fn add_block(&mut self, key: BlockKey, location: BlockLocation) {
    self.blocks.insert(key, location);
  }

  /// Mark the store dead; the reader frees it on the next prepare.
  pub fn close(&self) {
    self.closed.store(true, Ordering::Release);
  }
}

impl BackingStore for MemoryStore {
  fn has_data(&self) -> bool {
    !self.blocks.is_empty()
  }

  fn is_alive(&self) -> bool {
    !self.closed.load(Ordering::Acquire)
  }

  fn locate(&self, key: BlockKey) -> Option<BlockLocation> {
    self.blocks.get(&key).copied()
  }

  fn read(&self, location: &BlockLocation, buf: &mut [u8]) -> io::Result<()> {
    let data = self
      .files
      .get(&location.file)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bulk file not loaded"))?;
    read_slice(data, location, buf)
  }
}

/// Files on disk, opened lazily on first read.
pub struct FileStore {
  paths: HashMap<u64, PathBuf>,
  blocks: HashMap<BlockKey, BlockLocation>,
  /// Open handles; shared by the compute and coordinator threads.
  handles: Mutex<HashMap<u64, File>>,
}

impl FileStore {
  pub fn new() -> Self {
    Self {
      paths: HashMap::new(),
      blocks: HashMap::new(),
      handles: Mutex::new(HashMap::new()),
    }
  }

  pub fn add_file(&mut self, file: u64, path: impl Into<PathBuf>) {
    self.paths.insert(file, path.into());
  }

  pub fn add_block(&mut self, key: BlockKey, location: BlockLocation) {
    self.blocks.insert(key, location);
  }

  /// Number of file handles opened so far.
  pub fn open_handles(&self) -> usize {
    lock(&self.handles).len()
  }
}

impl Default for FileStore {
  fn default() -> Self {
    Self::new()
  }
}

impl BackingStore for FileStore {
  fn has_data(&self) -> bool {
    !self.blocks.is_empty()
  }

  fn locate(&self, key: BlockKey) -> Option<BlockLocation> {
    self.blocks.get(&key).copied()
  }

  fn read(&self, location: &BlockLocation, buf: &mut [u8]) -> io::Result<()> {
    let mut handles = lock(&self.handles);
    let file = match handles.entry(location.file) {
      std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
      std::collections::hash_map::Entry::Vacant(entry) => {
        let path = self
          .paths
          .get(&location.file)
          .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no path for data file"))?;
        entry.insert(File::open(path)?)
      }
    };
    file.seek(SeekFrom::Start(location.offset))?;
    file.read_exact(buf)
  }
}

/// Blobs addressed by content hash.
#[derive(Default)]
pub struct ContentStore {
  blocks: HashMap<BlockKey, u64>,
  content: HashMap<u64, Arc<[u8]>>,
}

impl ContentStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store a blob under `hash` and map `key` to it. Identical blobs share storage.
  pub fn insert(&mut self, key: BlockKey, hash: u64, data: impl Into<Arc<[u8]>>) {
    self.content.entry(hash).or_insert_with(|| data.into());
    self.blocks.insert(key, hash);
  }

  pub fn blob_count(&self) -> usize {
    self.content.len()
  }
}

impl BackingStore for ContentStore {
  fn has_data(&self) -> bool {
    !self.content.is_empty()
  }

  fn locate(&self, key: BlockKey) -> Option<BlockLocation> {
    let hash = *self.blocks.get(&key)?;
    let size = self.content.get(&hash)?.len();
    Some(BlockLocation {
      file: hash,
      offset: 0,
      size,
    })
  }

  fn read(&self, location: &BlockLocation, buf: &mut [u8]) -> io::Result<()> {
    let data = self
      .content
      .get(&location.file)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "content evicted"))?;
    read_slice(data, location, buf)
  }
}

// =============================================================================
// StreamingReader
// =============================================================================

type ReadOutput = io::Result<Vec<u8>>;

struct SourceState {
  store: Arc<dyn BackingStore>,
  cancelled: bool,
  outstanding: HashSet<OperationId>,
}

struct Operation {
  source: SourceId,
  receiver: Receiver<ReadOutput>,
  completed: Option<ReadOutput>,
}

#[derive(Default)]
struct ReaderState {
  sources: HashMap<SourceId, SourceState>,
  operations: HashMap<OperationId, Operation>,
  last_id: u64,
}

/// Async block reader over any number of sources.
#[derive(Default)]
pub struct StreamingReader {
  state: Mutex<ReaderState>,
}

impl StreamingReader {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `store` as the backing for `source`.
  ///
  /// Frees sources that were cancelled and drained or whose store died.
  /// Fails if `store` has no data.
  pub fn prepare_streaming(
    &self,
    source: SourceId,
    store: Arc<dyn BackingStore>,
  ) -> Result<(), StreamError> {
    let mut state = lock(&self.state);
    state
      .sources
      .retain(|_, s| s.store.is_alive() && !(s.cancelled && s.outstanding.is_empty()));

    if !store.has_data() {
      return Err(StreamError::NotPrepared(source));
    }

    let outstanding = state
      .sources
      .remove(&source)
      .map(|s| s.outstanding)
      .unwrap_or_default();
    state.sources.insert(
      source,
      SourceState {
        store,
        cancelled: false,
        outstanding,
      },
    );
    Ok(())
  }

  /// True if `source` accepts reads.
  pub fn is_prepared(&self, source: SourceId) -> bool {
    lock(&self.state)
      .sources
      .get(&source)
      .is_some_and(|s| !s.cancelled && s.store.is_alive())
  }

  /// Start reading `size` bytes of `key` from `source`.
  ///
  /// On failure the callback is invoked with `false` before returning.
  pub fn begin_read(
    &self,
    source: SourceId,
    key: BlockKey,
    size: usize,
    callback: Option<ReadCallback>,
  ) -> Result<OperationId, StreamError> {
    let mut state = lock(&self.state);

    let store = match state.sources.get(&source) {
      Some(s) if !s.cancelled && s.store.is_alive() => Arc::clone(&s.store),
      _ => {
        drop(state);
        fail(callback);
        return Err(StreamError::NotPrepared(source));
      }
    };

    let Some(location) = store.locate(key) else {
      drop(state);
      tracing::warn!(?source, ?key, "streaming block not found");
      fail(callback);
      return Err(StreamError::BlockNotFound {
        source_id: source,
        key,
      });
    };

    state.last_id += 1;
    let id = OperationId(state.last_id);
    let (sender, receiver) = channel::bounded(1);
    state.operations.insert(
      id,
      Operation {
        source,
        receiver,
        completed: None,
      },
    );
    if let Some(s) = state.sources.get_mut(&source) {
      s.outstanding.insert(id);
    }
    drop(state);

    rayon::spawn(move || {
      let mut buf = vec![0u8; size];
      let output = store.read(&location, &mut buf).map(|()| buf);
      if let Some(callback) = callback {
        callback(output.is_ok());
      }
      // Receiver dropped = operation already abandoned
      let _ = sender.send(output);
    });

    Ok(id)
  }

  /// Non-blocking completion check. Unknown ids report `false`.
  pub fn poll(&self, id: OperationId) -> bool {
    let mut state = lock(&self.state);
    let Some(op) = state.operations.get_mut(&id) else {
      return false;
    };
    if op.completed.is_some() {
      return true;
    }
    match op.receiver.try_recv() {
      Ok(output) => {
        op.completed = Some(output);
        true
      }
      Err(TryRecvError::Empty) => false,
      Err(TryRecvError::Disconnected) => {
        op.completed = Some(Err(worker_lost()));
        true
      }
    }
  }

  /// Wait for a read, release it and return its bytes.
  pub fn end_read(&self, id: OperationId) -> Result<Vec<u8>, StreamError> {
    let op = {
      let mut state = lock(&self.state);
      let op = state
        .operations
        .remove(&id)
        .ok_or(StreamError::UnknownOperation(id))?;
      if let Some(s) = state.sources.get_mut(&op.source) {
        s.outstanding.remove(&id);
      }
      op
    };

    let output = match op.completed {
      Some(output) => output,
      None => op.receiver.recv().unwrap_or_else(|_| Err(worker_lost())),
    };
    Ok(output?)
  }

  /// True while `source` has reads that have not reached `end_read`.
  pub fn are_there_pending_ops(&self, source: SourceId) -> bool {
    lock(&self.state)
      .sources
      .get(&source)
      .is_some_and(|s| !s.outstanding.is_empty())
  }

  /// Number of reads that have not reached `end_read`.
  pub fn outstanding_count(&self) -> usize {
    lock(&self.state).operations.len()
  }

  /// Refuse further reads for `source`, drain its outstanding reads and
  /// drop its state. Returns the number of reads drained.
  pub fn cancel_streaming(&self, source: SourceId) -> usize {
    let pending: Vec<OperationId> = {
      let mut state = lock(&self.state);
      let Some(s) = state.sources.get_mut(&source) else {
        return 0;
      };
      s.cancelled = true;
      s.outstanding.iter().copied().collect()
    };

    let drained = self.drain(&pending);
    lock(&self.state).sources.remove(&source);
    tracing::debug!(?source, drained, "streaming cancelled");
    drained
  }

  /// Drain every outstanding read and forget all sources.
  pub fn end_streaming(&self) -> usize {
    let pending: Vec<OperationId> = lock(&self.state).operations.keys().copied().collect();
    let drained = self.drain(&pending);
    let mut state = lock(&self.state);
    state.sources.clear();
    state.operations.clear();
    drained
  }

  fn drain(&self, ids: &[OperationId]) -> usize {
    ids
      .iter()
      .filter(|&&id| match self.end_read(id) {
        Ok(_) => true,
        Err(StreamError::UnknownOperation(_)) => false,
        Err(err) => {
          tracing::warn!(?id, %err, "read failed while draining");
          true
        }
      })
      .count()
  }
}

fn fail(callback: Option<ReadCallback>) {
  if let Some(callback) = callback {
    callback(false);
  }
}

fn worker_lost() -> io::Error {
  io::Error::new(io::ErrorKind::BrokenPipe, "read worker dropped its result")
}

#[cfg(test)]
#[path = "streaming_test.rs"]
mod streaming_test;
