use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use super::*;

fn memory_store(blocks: u32, block_size: usize) -> MemoryStore {
  let mut store = MemoryStore::new();
  let data: Vec<u8> = (0..blocks as usize * block_size).map(|i| (i % 251) as u8).collect();
  store.add_file(0, data);
  for i in 0..blocks {
    store.add_block(
      BlockKey(i),
      BlockLocation {
        file: 0,
        offset: (i as usize * block_size) as u64,
        size: block_size,
      },
    );
  }
  store
}

/// Store whose reads take a while, to keep operations outstanding.
struct SlowStore {
  inner: MemoryStore,
  delay: Duration,
}

impl BackingStore for SlowStore {
  fn has_data(&self) -> bool {
    self.inner.has_data()
  }

  fn locate(&self, key: BlockKey) -> Option<BlockLocation> {
    self.inner.locate(key)
  }

  fn read(&self, location: &BlockLocation, buf: &mut [u8]) -> io::Result<()> {
    std::thread::sleep(self.delay);
    self.inner.read(location, buf)
  }
}

#[test]
fn test_read_roundtrip() {
  let reader = StreamingReader::new();
  reader
    .prepare_streaming(SourceId(1), Arc::new(memory_store(4, 16)))
    .unwrap();

  let id = reader.begin_read(SourceId(1), BlockKey(2), 16, None).unwrap();
  let bytes = reader.end_read(id).unwrap();

  let expected: Vec<u8> = (32..48).map(|i| (i % 251) as u8).collect();
  assert_eq!(bytes, expected);
  assert!(!reader.are_there_pending_ops(SourceId(1)));
}

#[test]
fn test_unprepared_source_fails_and_calls_back() {
  let reader = StreamingReader::new();
  let called = Arc::new(Mutex::new(None));
  let sink = Arc::clone(&called);

  let err = reader
    .begin_read(
      SourceId(9),
      BlockKey(0),
      8,
      Some(Box::new(move |ok| *sink.lock().unwrap() = Some(ok))),
    )
    .unwrap_err();

  assert!(matches!(err, StreamError::NotPrepared(SourceId(9))));
  assert_eq!(*called.lock().unwrap(), Some(false));
}

#[test]
fn test_missing_block() {
  let reader = StreamingReader::new();
  reader
    .prepare_streaming(SourceId(1), Arc::new(memory_store(2, 8)))
    .unwrap();

  let err = reader.begin_read(SourceId(1), BlockKey(7), 8, None).unwrap_err();
  assert!(matches!(err, StreamError::BlockNotFound { key: BlockKey(7), .. }));
  assert_eq!(reader.outstanding_count(), 0);
}

#[test]
fn test_prepare_rejects_empty_store() {
  let reader = StreamingReader::new();
  let err = reader
    .prepare_streaming(SourceId(1), Arc::new(MemoryStore::new()))
    .unwrap_err();
  assert!(matches!(err, StreamError::NotPrepared(_)));
  assert!(!reader.is_prepared(SourceId(1)));
}

#[test]
fn test_operation_ids_increase() {
  let reader = StreamingReader::new();
  reader
    .prepare_streaming(SourceId(1), Arc::new(memory_store(4, 4)))
    .unwrap();

  let a = reader.begin_read(SourceId(1), BlockKey(0), 4, None).unwrap();
  let b = reader.begin_read(SourceId(1), BlockKey(1), 4, None).unwrap();
  reader.end_read(a).unwrap();
  let c = reader.begin_read(SourceId(1), BlockKey(2), 4, None).unwrap();

  assert!(a.raw() < b.raw() && b.raw() < c.raw());
  reader.end_read(b).unwrap();
  reader.end_read(c).unwrap();

  // Each id ends exactly once
  assert!(matches!(
    reader.end_read(a),
    Err(StreamError::UnknownOperation(_))
  ));
}

#[test]
fn test_poll_reports_completion() {
  let reader = StreamingReader::new();
  reader
    .prepare_streaming(SourceId(1), Arc::new(memory_store(1, 32)))
    .unwrap();
  let id = reader.begin_read(SourceId(1), BlockKey(0), 32, None).unwrap();

  let mut done = false;
  for _ in 0..1000 {
    if reader.poll(id) {
      done = true;
      break;
    }
    std::thread::sleep(Duration::from_millis(1));
  }

  assert!(done);
  // Polling does not release the operation
  assert!(reader.are_there_pending_ops(SourceId(1)));
  assert_eq!(reader.end_read(id).unwrap().len(), 32);
}

#[test]
fn test_cancel_drains_outstanding_reads() {
  let reader = StreamingReader::new();
  let store = SlowStore {
    inner: memory_store(8, 64),
    delay: Duration::from_millis(5),
  };
  reader.prepare_streaming(SourceId(3), Arc::new(store)).unwrap();

  let completed = Arc::new(AtomicUsize::new(0));
  for i in 0..8 {
    let completed = Arc::clone(&completed);
    reader
      .begin_read(
        SourceId(3),
        BlockKey(i),
        64,
        Some(Box::new(move |ok| {
          assert!(ok);
          completed.fetch_add(1, Ordering::SeqCst);
        })),
      )
      .unwrap();
  }

  let drained = reader.cancel_streaming(SourceId(3));

  assert_eq!(drained, 8);
  assert_eq!(completed.load(Ordering::SeqCst), 8);
  assert_eq!(reader.outstanding_count(), 0);
  assert!(!reader.are_there_pending_ops(SourceId(3)));

  // Cancelled sources refuse new reads
  let err = reader.begin_read(SourceId(3), BlockKey(0), 64, None).unwrap_err();
  assert!(matches!(err, StreamError::NotPrepared(_)));
}

#[test]
fn test_closed_store_is_freed_on_prepare() {
  let reader = StreamingReader::new();
  let dead = Arc::new(memory_store(1, 4));
  reader.prepare_streaming(SourceId(1), dead.clone()).unwrap();
  dead.close();

  assert!(!reader.is_prepared(SourceId(1)));
  reader
    .prepare_streaming(SourceId(2), Arc::new(memory_store(1, 4)))
    .unwrap();
  assert!(reader.begin_read(SourceId(1), BlockKey(0), 4, None).is_err());
}

#[test]
fn test_end_streaming_clears_everything() {
  let reader = StreamingReader::new();
  reader
    .prepare_streaming(SourceId(1), Arc::new(memory_store(4, 8)))
    .unwrap();
  reader
    .prepare_streaming(SourceId(2), Arc::new(memory_store(4, 8)))
    .unwrap();
  reader.begin_read(SourceId(1), BlockKey(0), 8, None).unwrap();
  reader.begin_read(SourceId(2), BlockKey(1), 8, None).unwrap();

  assert_eq!(reader.end_streaming(), 2);
  assert_eq!(reader.outstanding_count(), 0);
  assert!(!reader.is_prepared(SourceId(1)));
  assert!(!reader.is_prepared(SourceId(2)));
}

#[test]
fn test_file_store_opens_lazily() {
  let dir = std::env::temp_dir().join(format!("instance_scheduler_stream_{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join("model.bin");
  std::fs::write(&path, b"headerPAYLOADtrailer").unwrap();

  let mut store = FileStore::new();
  store.add_file(5, &path);
  store.add_block(
    BlockKey(0),
    BlockLocation {
      file: 5,
      offset: 6,
      size: 7,
    },
  );
  let store = Arc::new(store);
  assert_eq!(store.open_handles(), 0);

  let reader = StreamingReader::new();
  reader.prepare_streaming(SourceId(1), store.clone()).unwrap();
  let id = reader.begin_read(SourceId(1), BlockKey(0), 7, None).unwrap();

  assert_eq!(reader.end_read(id).unwrap(), b"PAYLOAD");
  assert_eq!(store.open_handles(), 1);

  std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_file_surfaces_io_error() {
  let mut store = FileStore::new();
  store.add_file(1, "/nonexistent/instance_scheduler/data.bin");
  store.add_block(
    BlockKey(0),
    BlockLocation {
      file: 1,
      offset: 0,
      size: 4,
    },
  );

  let reader = StreamingReader::new();
  reader.prepare_streaming(SourceId(1), Arc::new(store)).unwrap();
  let id = reader.begin_read(SourceId(1), BlockKey(0), 4, None).unwrap();
  assert!(matches!(reader.end_read(id), Err(StreamError::Io(_))));
}

#[test]
fn test_content_store_dedups_blobs() {
  let mut store = ContentStore::new();
  store.insert(BlockKey(0), 0xabc, vec![1u8, 2, 3]);
  store.insert(BlockKey(1), 0xabc, vec![1u8, 2, 3]);
  store.insert(BlockKey(2), 0xdef, vec![9u8; 5]);
  assert_eq!(store.blob_count(), 2);

  let reader = StreamingReader::new();
  reader.prepare_streaming(SourceId(1), Arc::new(store)).unwrap();
  let id = reader.begin_read(SourceId(1), BlockKey(1), 3, None).unwrap();
  assert_eq!(reader.end_read(id).unwrap(), vec![1, 2, 3]);
}
