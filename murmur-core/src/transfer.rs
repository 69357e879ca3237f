//! File transfer: split a payload into descending-counter chunks, track acknowledgements
//! on the sending side, reassemble on the receiving side.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::protocol::{FileChunk, PeerId, MAX_NAME_LEN};
use crate::wire::{FILE_CHUNK_OVERHEAD, MAX_SEND_LEN};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64_000;

/// The chunk counter is 8 bits wide.
pub const MAX_CHUNKS: usize = u8::MAX as usize + 1;

/// Largest chunk whose FileChunk datagram, with the longest name, fits [`MAX_SEND_LEN`].
pub const MAX_CHUNK_SIZE: usize = MAX_SEND_LEN - FILE_CHUNK_OVERHEAD - MAX_NAME_LEN;

/// Completed file IDs remembered per sender so late duplicates stay no-ops.
const COMPLETED_MEMORY: usize = 64;

/// One outbound fragment. `index` counts down to 0 for the last fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlice<'a> {
    pub index: u8,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("file of {len} bytes needs more than {MAX_CHUNKS} chunks of {chunk_size} bytes")]
pub struct FileTooLarge {
    pub len: usize,
    pub chunk_size: usize,
}

/// Split `data` into chunks of at most `chunk_size` bytes, first chunk carrying the
/// highest counter. An empty payload is one empty chunk with counter 0.
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Result<Vec<ChunkSlice<'_>>, FileTooLarge> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    if data.is_empty() {
        return Ok(vec![ChunkSlice { index: 0, data }]);
    }
    let count = data.len().div_ceil(size);
    if count > MAX_CHUNKS {
        return Err(FileTooLarge {
            len: data.len(),
            chunk_size: size,
        });
    }
    Ok(data
        .chunks(size)
        .enumerate()
        .map(|(i, data)| ChunkSlice {
            index: (count - 1 - i) as u8,
            data,
        })
        .collect())
}

/// Sender-side progress of one file.
#[derive(Debug)]
pub struct OutgoingFile {
    pub peer: PeerId,
    pub file_id: u8,
    pub message_id: u16,
    /// Chunk length by counter.
    sizes: HashMap<u8, u64>,
    acked: BTreeSet<u8>,
    total: u64,
}

impl OutgoingFile {
    pub fn new(peer: PeerId, file_id: u8, message_id: u16, chunks: &[ChunkSlice<'_>]) -> Self {
        Self {
            peer,
            file_id,
            message_id,
            sizes: chunks
                .iter()
                .map(|c| (c.index, c.data.len() as u64))
                .collect(),
            acked: BTreeSet::new(),
            total: chunks.iter().map(|c| c.data.len() as u64).sum(),
        }
    }

    /// Record an ack. Returns `(acked_bytes, total_bytes)` the first time a chunk is
    /// acknowledged, `None` for duplicates or unknown counters.
    pub fn mark_acked(&mut self, index: u8) -> Option<(u64, u64)> {
        if !self.sizes.contains_key(&index) || !self.acked.insert(index) {
            return None;
        }
        Some((self.acked_bytes(), self.total))
    }

    fn acked_bytes(&self) -> u64 {
        self.acked.iter().filter_map(|i| self.sizes.get(i)).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.acked.len() == self.sizes.len()
    }
}

/// Receiver-side reassembly buffer for one `(sender, file_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    pub name: String,
    pub total_length: u64,
    pub message_id: u16,
    last_activity: Instant,
    chunks: BTreeMap<u8, Vec<u8>>,
}

impl IncomingFile {
    pub fn new(name: String, total_length: u64, message_id: u16, now: Instant) -> Self {
        Self {
            name,
            total_length,
            message_id,
            last_activity: now,
            chunks: BTreeMap::new(),
        }
    }

    /// Whether `chunk` belongs to this transfer rather than an older one reusing the file ID.
    fn accepts(&self, chunk: &FileChunk) -> bool {
        self.message_id == chunk.message_id && self.total_length == u64::from(chunk.total_length)
    }

    /// Store a chunk. Returns `false` if this counter was already present.
    pub fn insert(&mut self, index: u8, data: Vec<u8>) -> bool {
        if self.chunks.contains_key(&index) {
            return false;
        }
        self.chunks.insert(index, data);
        true
    }

    pub fn received_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.len() as u64).sum()
    }

    /// Counter 0 present, no gaps between the highest counter and 0, and the byte count
    /// matching the declared length.
    pub fn is_complete(&self) -> bool {
        let Some((&highest, _)) = self.chunks.last_key_value() else {
            return false;
        };
        self.chunks.contains_key(&0)
            && self.chunks.len() == highest as usize + 1
            && self.received_bytes() == self.total_length
    }

    /// Concatenate from the highest counter down to 0.
    pub fn reassemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_length as usize);
        for data in self.chunks.values().rev() {
            out.extend_from_slice(data);
        }
        out
    }
}

/// Result of processing a received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk stored; file complete and reassembled.
    Complete { name: String, data: Vec<u8> },
    /// Chunk stored; more chunks outstanding.
    InProgress { received: u64, total: u64 },
    /// Counter already held or file already completed.
    Duplicate,
}

/// All in-flight transfers of one node, both directions.
#[derive(Debug, Default)]
pub struct TransferTable {
    outgoing: HashMap<(PeerId, u16), OutgoingFile>,
    incoming: HashMap<(PeerId, u8), IncomingFile>,
    completed: HashMap<PeerId, VecDeque<u8>>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_outgoing(&mut self, file: OutgoingFile) {
        self.outgoing.insert((file.peer, file.message_id), file);
    }

    pub fn outgoing_mut(&mut self, peer: PeerId, message_id: u16) -> Option<&mut OutgoingFile> {
        self.outgoing.get_mut(&(peer, message_id))
    }

    pub fn finish_outgoing(&mut self, peer: PeerId, message_id: u16) -> Option<OutgoingFile> {
        self.outgoing.remove(&(peer, message_id))
    }

    pub fn is_outgoing(&self, peer: PeerId, message_id: u16) -> bool {
        self.outgoing.contains_key(&(peer, message_id))
    }

    pub fn incoming(&self, peer: PeerId, file_id: u8) -> Option<&IncomingFile> {
        self.incoming.get(&(peer, file_id))
    }

    /// Drop reassembly buffers and completion memory of a peer that expired or renewed its
    /// secret. Outgoing files run on until acked or exhausted.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.incoming.retain(|(p, _), _| *p != peer);
        self.completed.remove(&peer);
    }

    /// Drop reassembly buffers that saw no chunk for `max_idle`. The sender has given up on
    /// them by then.
    pub fn expire_stale(&mut self, now: Instant, max_idle: Duration) -> Vec<(PeerId, u8)> {
        let mut stale: Vec<(PeerId, u8)> = self
            .incoming
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.last_activity) >= max_idle)
            .map(|(k, _)| *k)
            .collect();
        stale.sort();
        for key in &stale {
            self.incoming.remove(key);
        }
        stale
    }

    /// Store a received chunk and report whether its file is now complete.
    pub fn on_chunk(&mut self, chunk: FileChunk, now: Instant) -> ChunkReceiveResult {
        let sender = chunk.sender;
        if self
            .completed
            .get(&sender)
            .is_some_and(|done| done.contains(&chunk.file_id))
        {
            return ChunkReceiveResult::Duplicate;
        }
        let key = (sender, chunk.file_id);
        if self.incoming.get(&key).is_some_and(|f| !f.accepts(&chunk)) {
            self.incoming.remove(&key);
        }
        let file = self.incoming.entry(key).or_insert_with(|| {
            IncomingFile::new(
                chunk.name,
                u64::from(chunk.total_length),
                chunk.message_id,
                now,
            )
        });
        file.last_activity = now;
        if !file.insert(chunk.chunk_index, chunk.data) {
            return ChunkReceiveResult::Duplicate;
        }
        if !file.is_complete() {
            return ChunkReceiveResult::InProgress {
                received: file.received_bytes(),
                total: file.total_length,
            };
        }
        let data = file.reassemble();
        let name = std::mem::take(&mut file.name);
        self.incoming.remove(&key);
        let done = self.completed.entry(sender).or_default();
        if done.len() == COMPLETED_MEMORY {
            done.pop_front();
        }
        done.push_back(chunk.file_id);
        ChunkReceiveResult::Complete { name, data }
    }
}
