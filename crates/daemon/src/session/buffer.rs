//! Bounded output history for a session.
//!
//! Agent output is kept as a fixed-capacity ring of text chunks. Pushing onto
//! a full buffer evicts the oldest chunk in O(1).

/// Fixed-capacity FIFO of output chunks.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    slots: Vec<Option<String>>,
    /// Index of the oldest chunk.
    head: usize,
    len: usize,
}

impl OutputBuffer {
    /// Creates an empty buffer holding at most `capacity` chunks.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    /// Maximum number of chunks retained.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of chunks currently retained.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no chunk is retained.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a chunk, evicting the oldest one when full.
    ///
    /// Returns the evicted chunk, if any.
    pub fn push(&mut self, chunk: String) -> Option<String> {
        let capacity = self.capacity();
        if self.len < capacity {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(chunk);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.head].replace(chunk);
            self.head = (self.head + 1) % capacity;
            evicted
        }
    }

    /// Iterates over retained chunks, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % capacity].as_deref())
    }

    /// Returns the most recent `n` chunks, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.len.saturating_sub(n);
        self.iter().skip(skip).map(str::to_owned).collect()
    }

    /// Returns every retained chunk, oldest first.
    pub fn to_vec(&self) -> Vec<String> {
        self.iter().map(str::to_owned).collect()
    }
}
