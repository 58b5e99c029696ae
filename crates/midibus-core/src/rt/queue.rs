//! Timestamp-ordered reorder queue
//!
//! A fixed byte arena plus an entry index. Payloads are bump-allocated into the
//! arena; the index is sorted by `(time, insertion order)` only when something
//! was pushed since the last pop. The arena is reset once the queue has been
//! drained, so steady-state operation never allocates.

/// One entry popped from the queue
#[derive(Debug, PartialEq, Eq)]
pub struct QueuedEvent<'a> {
    pub port: usize,
    pub time: u64,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    time: u64,
    seq: u64,
    port: usize,
    offset: usize,
    size: usize,
}

/// Bounded reorder queue keyed by absolute frame time
pub struct ReorderQueue {
    pool: Box<[u8]>,
    used: usize,
    entries: Vec<Entry>,
    max_entries: usize,
    /// Index of the next entry to pop; everything before it is spent
    head: usize,
    dirty: bool,
    next_seq: u64,
}

impl ReorderQueue {
    /// Queue holding at most `max_entries` events and `pool_bytes` payload bytes
    pub fn with_capacity(max_entries: usize, pool_bytes: usize) -> Self {
        Self {
            pool: vec![0u8; pool_bytes].into_boxed_slice(),
            used: 0,
            entries: Vec::with_capacity(max_entries),
            max_entries,
            head: 0,
            dirty: false,
            next_seq: 0,
        }
    }

    /// Reserve `size` payload bytes for an event at `time`
    ///
    /// Returns `None` (event dropped) when the entry table or the arena is full.
    pub fn push(&mut self, port: usize, time: u64, size: usize) -> Option<&mut [u8]> {
        if self.entries.len() == self.max_entries && self.head > 0 {
            // Reclaim spent index slots; drain does not reallocate
            self.entries.drain(..self.head);
            self.head = 0;
        }
        if self.entries.len() >= self.max_entries || self.pool.len() - self.used < size {
            return None;
        }

        let offset = self.used;
        self.used += size;
        self.entries.push(Entry {
            time,
            seq: self.next_seq,
            port,
            offset,
            size,
        });
        self.next_seq += 1;
        self.dirty = true;
        Some(&mut self.pool[offset..offset + size])
    }

    /// Copy `bytes` in as a new event. Returns `false` if it was dropped.
    pub fn push_bytes(&mut self, port: usize, time: u64, bytes: &[u8]) -> bool {
        match self.push(port, time, bytes.len()) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn sort_if_dirty(&mut self) {
        if self.dirty {
            self.entries[self.head..].sort_unstable_by_key(|e| (e.time, e.seq));
            self.dirty = false;
        }
    }

    /// Time of the earliest queued event
    pub fn peek_time(&mut self) -> Option<u64> {
        self.sort_if_dirty();
        self.entries.get(self.head).map(|e| e.time)
    }

    /// Remove the earliest event
    ///
    /// Popping an empty queue resets the arena.
    pub fn pop(&mut self) -> Option<QueuedEvent<'_>> {
        if self.head >= self.entries.len() {
            self.clear();
            return None;
        }
        self.sort_if_dirty();

        let entry = self.entries[self.head];
        self.head += 1;
        Some(QueuedEvent {
            port: entry.port,
            time: entry.time,
            bytes: &self.pool[entry.offset..entry.offset + entry.size],
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and reset the arena
    pub fn clear(&mut self) {
        self.entries.clear();
        self.head = 0;
        self.used = 0;
        self.dirty = false;
    }

    /// Free arena bytes
    pub fn pool_available(&self) -> usize {
        self.pool.len() - self.used
    }
}
