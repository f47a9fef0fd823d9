use crate::error::ConflictError;
use crate::world::housing::{House, HouseTable, Town, TownTable};
use crate::world::position::{Position, MAP_MAX_HEIGHT, MAP_MAX_WIDTH};
use crate::world::region::Region;
use crate::world::sector::{IndexStats, TileIndex, Tiles, DEFAULT_VACANT_POOL};
use crate::world::spawns::{Spawn, SpawnTable};
use crate::world::tile::Tile;
use crate::world::waypoints::{Waypoint, Waypoints};
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_MAP_WIDTH: u16 = 2048;
pub const DEFAULT_MAP_HEIGHT: u16 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapMetadata {
    pub width: u16,
    pub height: u16,
    /// Format version the map was read from; saving always writes the current one.
    pub version: u32,
    pub items_major: u32,
    pub items_minor: u32,
    pub description: String,
    pub spawn_file: String,
    pub house_file: String,
}

impl MapMetadata {
    pub fn new(width: u16, height: u16) -> Self {
        MapMetadata {
            width: width.clamp(1, MAP_MAX_WIDTH),
            height: height.clamp(1, MAP_MAX_HEIGHT),
            version: crate::codec::CURRENT_VERSION,
            items_major: 3,
            items_minor: 57,
            description: String::new(),
            spawn_file: String::new(),
            house_file: String::new(),
        }
    }
}

impl Default for MapMetadata {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_WIDTH, DEFAULT_MAP_HEIGHT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapStats {
    pub tiles: usize,
    pub items: usize,
    pub creatures: usize,
    pub house_tiles: usize,
    pub houses: usize,
    pub towns: usize,
    pub waypoints: usize,
    pub spawns: usize,
    pub sectors: usize,
}

/// The in-memory map. Outside the crate it is read-only; every mutation goes
/// through [`MapStore::apply`].
#[derive(Debug, Clone)]
pub struct MapStore {
    metadata: MapMetadata,
    tiles: TileIndex,
    houses: HouseTable,
    towns: TownTable,
    waypoints: Waypoints,
    spawns: SpawnTable,
    house_tiles: HashMap<u32, BTreeSet<Position>>,
    revision: u64,
}

impl MapStore {
    pub fn new(width: u16, height: u16) -> Self {
        Self::with_metadata(MapMetadata::new(width, height), DEFAULT_VACANT_POOL)
    }

    pub fn with_metadata(metadata: MapMetadata, vacant_pool: usize) -> Self {
        MapStore {
            metadata,
            tiles: TileIndex::new(vacant_pool),
            houses: HouseTable::new(),
            towns: TownTable::new(),
            waypoints: Waypoints::new(),
            spawns: SpawnTable::new(),
            house_tiles: HashMap::new(),
            revision: 0,
        }
    }

    pub fn metadata(&self) -> &MapMetadata {
        &self.metadata
    }

    /// Number of batches committed to this store since it was created or loaded.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn tile(&self, position: Position) -> Option<&Tile> {
        self.tiles.get(position)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Read-only walk for renderers and the codec, ordered by (z, y, x).
    pub fn iter(&self, region: Option<Region>) -> Tiles<'_> {
        self.tiles.iter(region)
    }

    pub fn index_stats(&self) -> &IndexStats {
        self.tiles.stats()
    }

    pub fn houses(&self) -> &HouseTable {
        &self.houses
    }

    pub fn house(&self, id: u32) -> Option<&House> {
        self.houses.get(&id)
    }

    /// Member tiles of a house, through the back-reference index.
    pub fn house_tiles(&self, id: u32) -> impl Iterator<Item = Position> + '_ {
        self.house_tiles
            .get(&id)
            .into_iter()
            .flat_map(|positions| positions.iter().copied())
    }

    pub fn towns(&self) -> &TownTable {
        &self.towns
    }

    pub fn town(&self, id: u32) -> Option<&Town> {
        self.towns.get(&id)
    }

    pub fn waypoints(&self) -> &Waypoints {
        &self.waypoints
    }

    pub fn spawns(&self) -> &SpawnTable {
        &self.spawns
    }

    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            tiles: self.tiles.len(),
            houses: self.houses.len(),
            towns: self.towns.len(),
            waypoints: self.waypoints.len(),
            spawns: self.spawns.len(),
            sectors: self.tiles.sector_count(),
            ..MapStats::default()
        };
        for tile in self.tiles.iter(None) {
            stats.items += tile.item_count();
            if tile.creature.is_some() {
                stats.creatures += 1;
            }
            if tile.is_house_tile() {
                stats.house_tiles += 1;
            }
        }
        stats
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut MapMetadata {
        &mut self.metadata
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Stores a tile, dropping it instead when it holds nothing.
    pub(crate) fn put_tile(&mut self, tile: Tile) -> Result<Option<Tile>, ConflictError> {
        let position = tile.position;
        if tile.is_empty() {
            return Ok(self.remove_tile(position));
        }
        let house_id = tile.house_id;
        let previous = self.tiles.insert(tile)?;
        self.unlink_house(previous.as_ref().and_then(|tile| tile.house_id), position);
        if let Some(id) = house_id {
            self.house_tiles.entry(id).or_default().insert(position);
        }
        Ok(previous)
    }

    pub(crate) fn remove_tile(&mut self, position: Position) -> Option<Tile> {
        let removed = self.tiles.erase(position)?;
        self.unlink_house(removed.house_id, position);
        Some(removed)
    }

    pub(crate) fn put_house(&mut self, id: u32, house: Option<House>) -> Option<House> {
        match house {
            Some(house) => self.houses.insert(id, house),
            None => self.houses.remove(&id),
        }
    }

    pub(crate) fn put_town(&mut self, id: u32, town: Option<Town>) -> Option<Town> {
        match town {
            Some(town) => self.towns.insert(id, town),
            None => self.towns.remove(&id),
        }
    }

    pub(crate) fn put_waypoint(&mut self, name: &str, waypoint: Option<Waypoint>) -> Option<Waypoint> {
        match waypoint {
            Some(waypoint) => self.waypoints.insert(waypoint),
            None => self.waypoints.remove(name),
        }
    }

    pub(crate) fn put_spawn(&mut self, center: Position, spawn: Option<Spawn>) -> Option<Spawn> {
        match spawn {
            Some(spawn) => self.spawns.insert(center, spawn),
            None => self.spawns.remove(&center),
        }
    }

    /// Replaces every tile inside `region` with `tiles` (resync of one area).
    pub(crate) fn replace_region(
        &mut self,
        region: Region,
        tiles: Vec<Tile>,
    ) -> Result<(), ConflictError> {
        if let Some(outside) = tiles
            .iter()
            .find(|tile| !region.contains(tile.position) || !tile.position.is_valid())
        {
            return Err(ConflictError::OutOfBounds(outside.position));
        }
        let stale: Vec<Position> = self.tiles.iter(Some(region)).map(|tile| tile.position).collect();
        for position in stale {
            self.remove_tile(position);
        }
        for tile in tiles {
            self.put_tile(tile)?;
        }
        Ok(())
    }

    fn unlink_house(&mut self, house_id: Option<u32>, position: Position) {
        let Some(id) = house_id else {
            return;
        };
        if let Some(members) = self.house_tiles.get_mut(&id) {
            members.remove(&position);
            if members.is_empty() {
                self.house_tiles.remove(&id);
            }
        }
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_WIDTH, DEFAULT_MAP_HEIGHT)
    }
}

// Structural equality: same content, regardless of revision counters or
// sector pool state.
impl PartialEq for MapStore {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && self.houses == other.houses
            && self.towns == other.towns
            && self.waypoints == other.waypoints
            && self.spawns == other.spawns
            && self.tiles.len() == other.tiles.len()
            && self.tiles.iter(None).eq(other.tiles.iter(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::item::Item;

    #[test]
    fn empty_tiles_are_not_stored() {
        let mut map = MapStore::new(256, 256);
        let position = Position::new(10, 10, 7);
        map.put_tile(Tile::new(position).with_item(Item::new(100)))
            .expect("put");
        assert_eq!(map.tile_count(), 1);
        let previous = map.put_tile(Tile::new(position)).expect("put empty");
        assert_eq!(previous.map(|tile| tile.items.len()), Some(1));
        assert_eq!(map.tile_count(), 0);
        assert!(map.tile(position).is_none());
    }

    #[test]
    fn house_back_reference_follows_tiles() {
        let mut map = MapStore::new(256, 256);
        map.put_house(4, Some(House::new(4, "Lakeside", 1)));
        let a = Position::new(20, 20, 7);
        let b = Position::new(21, 20, 7);
        for position in [a, b] {
            let mut tile = Tile::new(position);
            tile.house_id = Some(4);
            map.put_tile(tile).expect("put");
        }
        assert_eq!(map.house_tiles(4).collect::<Vec<_>>(), vec![a, b]);

        let mut moved = map.tile(a).cloned().expect("tile");
        moved.house_id = Some(5);
        moved.items.push(Item::new(1));
        map.put_tile(moved).expect("put");
        assert_eq!(map.house_tiles(4).collect::<Vec<_>>(), vec![b]);
        assert_eq!(map.house_tiles(5).collect::<Vec<_>>(), vec![a]);

        map.remove_tile(b);
        assert_eq!(map.house_tiles(4).count(), 0);
    }

    #[test]
    fn replace_region_drops_tiles_missing_from_snapshot() {
        let mut map = MapStore::new(256, 256);
        for x in 0..5 {
            map.put_tile(Tile::new(Position::new(x, 0, 7)).with_item(Item::new(1)))
                .expect("put");
        }
        let region = Region::new(Position::new(1, 0, 7), Position::new(3, 0, 7));
        let fresh = vec![Tile::new(Position::new(2, 0, 7)).with_item(Item::new(9))];
        map.replace_region(region, fresh).expect("replace");
        let left: Vec<(u16, u16)> = map
            .iter(None)
            .map(|tile| (tile.position.x, tile.items[0].type_id.0))
            .collect();
        assert_eq!(left, vec![(0, 1), (2, 9), (4, 1)]);
    }

    #[test]
    fn stats_count_nested_items() {
        let mut map = MapStore::new(256, 256);
        let mut tile = Tile::new(Position::new(1, 1, 7))
            .with_ground(Item::new(4526))
            .with_item(Item::new(1987).with_contents(vec![Item::new(2160)]));
        tile.house_id = Some(1);
        map.put_tile(tile).expect("put");
        let stats = map.stats();
        assert_eq!(stats.tiles, 1);
        assert_eq!(stats.items, 3);
        assert_eq!(stats.house_tiles, 1);
    }
}
