use crate::world::position::Position;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waypoint {
    pub name: String,
    pub position: Position,
}

/// Named positions, unique by case-insensitive name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Waypoints {
    by_name: BTreeMap<String, Waypoint>,
}

pub fn waypoint_key(name: &str) -> String {
    name.to_lowercase()
}

impl Waypoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Waypoint> {
        self.by_name.get(&waypoint_key(name))
    }

    /// Inserts or moves a waypoint, returning the entry it replaced.
    pub fn insert(&mut self, waypoint: Waypoint) -> Option<Waypoint> {
        self.by_name.insert(waypoint_key(&waypoint.name), waypoint)
    }

    pub fn remove(&mut self, name: &str) -> Option<Waypoint> {
        self.by_name.remove(&waypoint_key(name))
    }

    pub fn at(&self, position: Position) -> impl Iterator<Item = &Waypoint> {
        self.by_name
            .values()
            .filter(move |waypoint| waypoint.position == position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.by_name.values()
    }
}
