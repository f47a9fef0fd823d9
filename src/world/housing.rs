use crate::world::position::Position;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct House {
    pub id: u32,
    pub name: String,
    pub town_id: u32,
    pub rent: u32,
    pub exit: Option<Position>,
    pub guildhall: bool,
}

impl House {
    pub fn new(id: u32, name: impl Into<String>, town_id: u32) -> Self {
        House {
            id,
            name: name.into(),
            town_id,
            rent: 0,
            exit: None,
            guildhall: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Town {
    pub id: u32,
    pub name: String,
    pub temple: Position,
}

impl Town {
    pub fn new(id: u32, name: impl Into<String>, temple: Position) -> Self {
        Town {
            id,
            name: name.into(),
            temple,
        }
    }
}

pub type HouseTable = BTreeMap<u32, House>;
pub type TownTable = BTreeMap<u32, Town>;

/// Lowest id not used by any house, for editors creating a new one.
pub fn next_house_id(houses: &HouseTable) -> u32 {
    houses.keys().next_back().map_or(1, |id| id.saturating_add(1))
}

pub fn next_town_id(towns: &TownTable) -> u32 {
    towns.keys().next_back().map_or(1, |id| id.saturating_add(1))
}

pub fn houses_in_town(houses: &HouseTable, town_id: u32) -> impl Iterator<Item = &House> {
    houses.values().filter(move |house| house.town_id == town_id)
}
