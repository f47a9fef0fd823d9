use crate::edit::apply::AppliedBatch;
use crate::edit::change::ChangeBatch;
use std::collections::VecDeque;

pub const DEFAULT_UNDO_CAPACITY: usize = 256;

/// Where a recorded batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// Applied on behalf of another session; never queued for broadcast again.
    Remote { originator: u32 },
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub applied: AppliedBatch,
    pub origin: Origin,
}

/// Bounded undo/redo history plus the queue of local batches awaiting replication.
///
/// `entries[..cursor]` are applied, `entries[cursor..]` form the redo tail.
#[derive(Debug)]
pub struct Ledger {
    entries: VecDeque<LedgerEntry>,
    cursor: usize,
    capacity: usize,
    generation: u64,
    outbound: VecDeque<ChangeBatch>,
}

impl Ledger {
    pub fn new(capacity: usize) -> Self {
        Ledger {
            entries: VecDeque::new(),
            cursor: 0,
            capacity: capacity.max(1),
            generation: 0,
            outbound: VecDeque::new(),
        }
    }

    /// Records an applied batch, dropping the redo tail and the oldest entry
    /// once capacity is exceeded. No-op batches are ignored.
    pub fn push(&mut self, applied: AppliedBatch, origin: Origin) {
        if applied.is_noop() {
            return;
        }
        self.entries.truncate(self.cursor);
        if origin == Origin::Local {
            self.outbound.push_back(applied.forward.clone());
        }
        self.entries.push_back(LedgerEntry { applied, origin });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len();
        self.generation += 1;
    }

    /// Steps back one entry and returns the batch that reverts it.
    pub fn undo(&mut self) -> Option<ChangeBatch> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.generation += 1;
        let inverse = &self.entries[self.cursor].applied.inverse;
        Some(ChangeBatch::new(inverse.changes.clone()))
    }

    /// Steps forward one entry and returns the batch that re-applies it.
    pub fn redo(&mut self) -> Option<ChangeBatch> {
        let entry = self.entries.get(self.cursor)?;
        let forward = ChangeBatch::new(entry.applied.forward.changes.clone());
        self.cursor += 1;
        self.generation += 1;
        Some(forward)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bumped by every push, undo and redo. Lets callers detect that the
    /// history moved while an asynchronous undo was in flight.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    /// Queues an undo or redo replay for broadcast; these do not create entries.
    pub fn queue_outbound(&mut self, batch: ChangeBatch) {
        if !batch.is_empty() {
            self.outbound.push_back(batch);
        }
    }

    /// Local batches waiting to be replicated, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<ChangeBatch> {
        self.outbound.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.outbound.clear();
        self.cursor = 0;
        self.generation += 1;
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_CAPACITY)
    }
}
