use crate::world::position::Position;
use std::collections::BTreeMap;

pub const MAX_SPAWN_RADIUS: u16 = 64;

/// Spawn area; creatures inside it live on their tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawn {
    pub center: Position,
    pub radius: u16,
}

impl Spawn {
    pub fn new(center: Position, radius: u16) -> Self {
        Spawn {
            center,
            radius: radius.min(MAX_SPAWN_RADIUS),
        }
    }
}

pub type SpawnTable = BTreeMap<Position, Spawn>;
