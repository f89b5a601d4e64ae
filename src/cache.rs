//! Decoded-chunk cache with recency-based eviction
//!
//! Chunks are only ever touched at decode-completion time, so the ordering
//! structure is a plain recency list (most recent at the front), not an
//! LRU-on-access structure. Eviction pops from the tail until the cache fits
//! under the configured capacity minus the reserved headroom.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::frame::Frame;

/// All decoded frames of one chunk, keyed by global frame number.
#[derive(Debug, Default)]
pub struct DecodedChunk {
    frames: HashMap<u32, Arc<Frame>>,
}

impl DecodedChunk {
    pub fn new(frames: HashMap<u32, Arc<Frame>>) -> Self {
        Self { frames }
    }

    /// Handle for one frame, if it was decoded in this chunk.
    pub fn frame(&self, frame_number: u32) -> Option<Arc<Frame>> {
        self.frames.get(&frame_number).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Release every image handle this chunk owns.
    fn close(&mut self) {
        self.frames.clear();
    }
}

/// Bounded mapping from chunk index to decoded frames.
///
/// The recency list may contain one index that is not yet in the map: the
/// chunk currently being decoded, pushed to the front by `begin_insert`
/// before its frames exist. `cleanup` never evicts that entry.
#[derive(Debug)]
pub(crate) struct ChunkCache {
    chunks: HashMap<u32, DecodedChunk>,
    /// Chunk indices, most recently produced first
    recency: VecDeque<u32>,
    capacity: usize,
}

impl ChunkCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            chunks: HashMap::new(),
            recency: VecDeque::new(),
            // a cache that can hold nothing cannot serve frames
            capacity: capacity.max(1),
        }
    }

    /// Mark `chunk_index` as the most recently produced chunk ahead of its
    /// frames being installed.
    pub(crate) fn begin_insert(&mut self, chunk_index: u32) {
        self.recency.retain(|&index| index != chunk_index);
        self.recency.push_front(chunk_index);
    }

    /// Install the decoded frames for a chunk previously announced via
    /// `begin_insert`.
    pub(crate) fn install(&mut self, chunk_index: u32, decoded: DecodedChunk) {
        log::debug!(
            "caching chunk {} ({} frames, {}/{} slots used)",
            chunk_index,
            decoded.len(),
            self.chunks.len() + 1,
            self.capacity
        );
        self.chunks.insert(chunk_index, decoded);
    }

    /// Undo `begin_insert` after a failed decode pass.
    pub(crate) fn abort_insert(&mut self, chunk_index: u32) {
        if !self.chunks.contains_key(&chunk_index) {
            self.recency.retain(|&index| index != chunk_index);
        }
    }

    /// Evict least-recently-produced chunks until the cache holds at most
    /// `capacity - min(extra, capacity)` entries.
    ///
    /// `extra` reserves headroom for a chunk about to be inserted; `close`
    /// passes `usize::MAX` to evict everything.
    pub(crate) fn cleanup(&mut self, extra: usize) {
        let target = self.capacity - extra.min(self.capacity);
        while self.chunks.len() > target {
            let Some(&tail) = self.recency.back() else {
                break;
            };
            if !self.chunks.contains_key(&tail) {
                // the not-yet-installed chunk is the only entry left
                break;
            }
            self.recency.pop_back();
            if let Some(mut evicted) = self.chunks.remove(&tail) {
                log::debug!("evicting chunk {} ({} frames)", tail, evicted.len());
                evicted.close();
            }
        }
    }

    /// Evict everything, releasing every cached image handle.
    pub(crate) fn clear(&mut self) {
        self.cleanup(usize::MAX);
        self.recency.clear();
    }

    pub(crate) fn get(&self, chunk_index: u32) -> Option<&DecodedChunk> {
        self.chunks.get(&chunk_index)
    }

    pub(crate) fn contains(&self, chunk_index: u32) -> bool {
        self.chunks.contains_key(&chunk_index)
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached chunk indices in ascending order.
    pub(crate) fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.chunks.keys().copied().collect();
        indices.sort_unstable();
        indices
    }
}
