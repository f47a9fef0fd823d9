use crate::error::ConflictError;
use crate::session::SessionId;
use crate::world::position::Position;
use std::collections::{BTreeSet, HashMap};

/// Host-side tile ownership for batches in flight.
#[derive(Debug, Default)]
pub struct TileLocks {
    held: HashMap<Position, SessionId>,
}

impl TileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, position: Position) -> Option<SessionId> {
        self.held.get(&position).copied()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// First tile in `positions` held by a session other than `session`.
    pub fn check(&self, session: SessionId, positions: &BTreeSet<Position>) -> Result<(), ConflictError> {
        for position in positions {
            if let Some(holder) = self.holder(*position).filter(|holder| *holder != session) {
                return Err(ConflictError::TileLocked {
                    position: *position,
                    holder,
                });
            }
        }
        Ok(())
    }

    /// Locks every tile or none of them.
    pub fn try_lock(&mut self, session: SessionId, positions: &BTreeSet<Position>) -> Result<(), ConflictError> {
        self.check(session, positions)?;
        for position in positions {
            self.held.insert(*position, session);
        }
        Ok(())
    }

    pub fn release(&mut self, session: SessionId, positions: &BTreeSet<Position>) {
        for position in positions {
            if self.held.get(position) == Some(&session) {
                self.held.remove(position);
            }
        }
    }

    /// Drops everything `session` holds; returns how many tiles were freed.
    pub fn release_all(&mut self, session: SessionId) -> usize {
        let before = self.held.len();
        self.held.retain(|_, holder| *holder != session);
        before - self.held.len()
    }
}
