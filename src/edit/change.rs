use crate::entities::creature::Creature;
use crate::entities::item::{AttributeValue, Item};
use crate::world::housing::{House, Town};
use crate::world::position::Position;
use crate::world::spawns::Spawn;
use crate::world::tile::{Tile, TileFlags};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one batch for acknowledgement, undo bookkeeping and echo suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

impl BatchId {
    pub fn next() -> Self {
        BatchId(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One reversible mutation of the map store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Replace the whole tile; `None` erases it.
    ReplaceTile {
        position: Position,
        tile: Option<Tile>,
    },
    SetGround {
        position: Position,
        ground: Option<Item>,
    },
    /// Insert into the stack; `None` places it on top.
    AddItem {
        position: Position,
        index: Option<u16>,
        item: Item,
    },
    RemoveItem {
        position: Position,
        index: u16,
    },
    SetItemAttribute {
        position: Position,
        index: u16,
        key: String,
        value: Option<AttributeValue>,
    },
    SetTileFlags {
        position: Position,
        flags: TileFlags,
    },
    SetTileHouse {
        position: Position,
        house_id: Option<u32>,
    },
    SetCreature {
        position: Position,
        creature: Option<Creature>,
    },
    SetSpawn {
        center: Position,
        spawn: Option<Spawn>,
    },
    /// Removing a house also clears the reference on every member tile.
    SetHouse {
        id: u32,
        house: Option<House>,
    },
    SetTown {
        id: u32,
        town: Option<Town>,
    },
    SetWaypoint {
        name: String,
        position: Option<Position>,
    },
}

impl Change {
    /// Tile this change writes to directly, if any.
    pub fn position(&self) -> Option<Position> {
        match self {
            Change::ReplaceTile { position, .. }
            | Change::SetGround { position, .. }
            | Change::AddItem { position, .. }
            | Change::RemoveItem { position, .. }
            | Change::SetItemAttribute { position, .. }
            | Change::SetTileFlags { position, .. }
            | Change::SetTileHouse { position, .. }
            | Change::SetCreature { position, .. } => Some(*position),
            Change::SetSpawn { .. }
            | Change::SetHouse { .. }
            | Change::SetTown { .. }
            | Change::SetWaypoint { .. } => None,
        }
    }

    pub fn is_table_change(&self) -> bool {
        self.position().is_none()
    }
}

/// Ordered changes forming one undo step and one replication unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub id: BatchId,
    pub changes: Vec<Change>,
}

impl ChangeBatch {
    pub fn new(changes: Vec<Change>) -> Self {
        ChangeBatch {
            id: BatchId::next(),
            changes,
        }
    }

    pub fn with_id(id: BatchId, changes: Vec<Change>) -> Self {
        ChangeBatch { id, changes }
    }

    pub fn single(change: Change) -> Self {
        Self::new(vec![change])
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Tiles written directly by this batch. House removals also touch the
    /// house's member tiles; [`crate::world::map::MapStore::touched_by`] adds those.
    pub fn direct_positions(&self) -> BTreeSet<Position> {
        self.changes.iter().filter_map(Change::position).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ids_increase() {
        let a = BatchId::next();
        let b = BatchId::next();
        assert!(b > a);
    }

    #[test]
    fn direct_positions_skip_table_changes() {
        let batch = ChangeBatch::new(vec![
            Change::AddItem {
                position: Position::new(1, 1, 7),
                index: None,
                item: Item::new(100),
            },
            Change::RemoveItem {
                position: Position::new(1, 1, 7),
                index: 0,
            },
            Change::SetTown {
                id: 1,
                town: None,
            },
            Change::SetTileFlags {
                position: Position::new(2, 1, 7),
                flags: TileFlags::PROTECTION_ZONE,
            },
        ]);
        let positions: Vec<Position> = batch.direct_positions().into_iter().collect();
        assert_eq!(positions, vec![Position::new(1, 1, 7), Position::new(2, 1, 7)]);
        assert!(batch.changes[2].is_table_change());
    }
}
