use crate::world::position::Direction;

pub const DEFAULT_SPAWN_INTERVAL: u32 = 60;

/// A creature placed on a tile as part of a spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creature {
    pub name: String,
    /// Respawn delay in seconds.
    pub spawn_interval: u32,
    pub direction: Direction,
}

impl Creature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spawn_interval: DEFAULT_SPAWN_INTERVAL,
            direction: Direction::default(),
        }
    }

    pub fn with_interval(mut self, seconds: u32) -> Self {
        self.spawn_interval = seconds;
        self
    }
}
