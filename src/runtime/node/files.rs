//! File chunking and reassembly.
//!
//! File payloads are opaque pre-encoded sequences — the shell hands over
//! base64 text and the node never looks inside. The pipeline slices the
//! sequence into fixed windows for transport and the receiving side fills a
//! pre-allocated slot per chunk index; there is no loss detection and no
//! retransmission, so a dropped chunk leaves the file pending for the rest
//! of the session.

use std::collections::HashMap;

use super::protocol::FileMeta;

/// Bytes of pre-encoded payload carried per `file_chunk` envelope.
pub const FILE_CHUNK_SIZE: usize = 60_000;

/// Upper bound on an announced payload. Anything larger is ignored rather
/// than pre-allocated, so a hostile announcement cannot balloon memory.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Number of chunks a payload of `size` bytes splits into.
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(FILE_CHUNK_SIZE as u64) as u32
}

/// Borrow chunk `index` of `data`. Out-of-range indexes yield an empty
/// slice.
pub fn chunk_slice(data: &[u8], index: u32) -> &[u8] {
    let start = index as usize * FILE_CHUNK_SIZE;
    if start >= data.len() {
        return &[];
    }
    let end = usize::min(start + FILE_CHUNK_SIZE, data.len());
    &data[start..end]
}

/// A file announced by a `message` envelope, filling up chunk by chunk.
#[derive(Debug)]
struct PendingFile {
    name: String,
    chunks: Vec<Option<String>>,
    received: u32,
}

/// What happened to an incoming chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Placed into its slot; the file is still incomplete.
    Stored { received: u32, total: u32 },
    /// This chunk filled the last slot; the payload is fully reassembled.
    Completed { name: String, data: String },
    /// Unknown file id, out-of-range index, or an already-filled slot.
    Ignored,
}

/// Reassembly buffers plus the completed payloads the node can replay to
/// late joiners.
#[derive(Debug, Default)]
pub struct FileStore {
    pending: HashMap<String, PendingFile>,
    complete: HashMap<String, String>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate reassembly slots for a just-announced file. Metadata
    /// that is oversized or internally inconsistent is dropped here, before
    /// it can reserve anything.
    pub fn announce(&mut self, meta: &FileMeta) {
        if self.complete.contains_key(&meta.id) || self.pending.contains_key(&meta.id) {
            return;
        }
        if meta.size > MAX_FILE_SIZE {
            log::warn!(
                "ignoring announced file '{}' ({} bytes exceeds the {} byte cap)",
                meta.name,
                meta.size,
                MAX_FILE_SIZE
            );
            return;
        }
        if meta.total_chunks != chunk_count(meta.size) {
            log::warn!(
                "ignoring announced file '{}': {} chunks declared for {} bytes",
                meta.name,
                meta.total_chunks,
                meta.size
            );
            return;
        }
        if meta.total_chunks == 0 {
            // Empty file: nothing will ever arrive for it.
            self.complete.insert(meta.id.clone(), String::new());
            return;
        }
        self.pending.insert(
            meta.id.clone(),
            PendingFile {
                name: meta.name.clone(),
                chunks: vec![None; meta.total_chunks as usize],
                received: 0,
            },
        );
    }

    /// Store a payload the node already holds in full (local sends and
    /// finished reassemblies), making it available for history replay.
    pub fn insert_complete(&mut self, id: &str, data: String) {
        self.pending.remove(id);
        self.complete.insert(id.to_string(), data);
    }

    /// Place one received chunk. Chunks for unknown file ids are discarded.
    pub fn accept_chunk(&mut self, id: &str, index: u32, data: String) -> ChunkOutcome {
        let Some(pending) = self.pending.get_mut(id) else {
            return ChunkOutcome::Ignored;
        };
        let total = pending.chunks.len() as u32;
        let Some(slot) = pending.chunks.get_mut(index as usize) else {
            return ChunkOutcome::Ignored;
        };
        if slot.is_some() {
            return ChunkOutcome::Ignored;
        }
        *slot = Some(data);
        pending.received += 1;

        if pending.received < total {
            return ChunkOutcome::Stored {
                received: pending.received,
                total,
            };
        }

        let done = self.pending.remove(id).expect("pending entry just updated");
        let mut data = String::new();
        for chunk in done.chunks {
            data.push_str(&chunk.expect("every slot filled"));
        }
        self.complete.insert(id.to_string(), data.clone());
        ChunkOutcome::Completed {
            name: done.name,
            data,
        }
    }

    /// Full payload for a file id, when the node holds one.
    pub fn payload(&self, id: &str) -> Option<&str> {
        self.complete.get(id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, size: u64) -> FileMeta {
        FileMeta {
            id: id.into(),
            name: format!("{id}.bin"),
            size,
            total_chunks: chunk_count(size),
        }
    }

    #[test]
    fn test_chunk_count_math() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(60_000), 1);
        assert_eq!(chunk_count(60_001), 2);
        assert_eq!(chunk_count(150_000), 3);
    }

    #[test]
    fn test_chunk_slice_windows() {
        let data = vec![7u8; 150_000];
        assert_eq!(chunk_slice(&data, 0).len(), 60_000);
        assert_eq!(chunk_slice(&data, 1).len(), 60_000);
        assert_eq!(chunk_slice(&data, 2).len(), 30_000);
        assert_eq!(chunk_slice(&data, 3).len(), 0);
    }

    #[test]
    fn test_split_and_reassemble() {
        let payload = "x".repeat(150_000);
        let mut store = FileStore::new();
        store.announce(&meta("f1", payload.len() as u64));

        // Deliver out of order; completion fires on the last slot filled.
        for index in [2u32, 0, 1] {
            let chunk = String::from_utf8(chunk_slice(payload.as_bytes(), index).to_vec()).unwrap();
            match store.accept_chunk("f1", index, chunk) {
                ChunkOutcome::Completed { data, .. } => {
                    assert_eq!(index, 1);
                    assert_eq!(data.len(), payload.len());
                    assert_eq!(data, payload);
                }
                ChunkOutcome::Stored { total, .. } => assert_eq!(total, 3),
                ChunkOutcome::Ignored => panic!("chunk {index} ignored"),
            }
        }
        assert_eq!(store.payload("f1").unwrap().len(), payload.len());
    }

    #[test]
    fn test_unknown_file_discarded() {
        let mut store = FileStore::new();
        assert!(matches!(
            store.accept_chunk("nope", 0, "data".into()),
            ChunkOutcome::Ignored
        ));
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let mut store = FileStore::new();
        store.announce(&meta("f1", 70_000));
        assert!(matches!(
            store.accept_chunk("f1", 0, "a".repeat(60_000)),
            ChunkOutcome::Stored { received: 1, total: 2 }
        ));
        assert!(matches!(
            store.accept_chunk("f1", 0, "b".repeat(60_000)),
            ChunkOutcome::Ignored
        ));
    }

    #[test]
    fn test_hostile_metadata_rejected() {
        let mut store = FileStore::new();

        store.announce(&FileMeta {
            id: "huge".into(),
            name: "huge.bin".into(),
            size: u64::MAX,
            total_chunks: 3,
        });
        store.announce(&FileMeta {
            id: "lying".into(),
            name: "lying.bin".into(),
            size: 60_000,
            total_chunks: 40_000,
        });

        assert!(matches!(
            store.accept_chunk("huge", 0, "x".into()),
            ChunkOutcome::Ignored
        ));
        assert!(matches!(
            store.accept_chunk("lying", 0, "x".into()),
            ChunkOutcome::Ignored
        ));
    }

    #[test]
    fn test_empty_file_is_complete_immediately() {
        let mut store = FileStore::new();
        store.announce(&meta("empty", 0));
        assert_eq!(store.payload("empty"), Some(""));
    }

    #[test]
    fn test_missing_chunk_leaves_file_pending() {
        let mut store = FileStore::new();
        store.announce(&meta("f1", 120_001));
        store.accept_chunk("f1", 0, "a".repeat(60_000));
        store.accept_chunk("f1", 2, "c".into());
        assert!(store.payload("f1").is_none());
    }
}
