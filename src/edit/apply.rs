use crate::edit::change::{BatchId, Change, ChangeBatch};
use crate::entities::item::{Item, MAX_CONTAINER_DEPTH};
use crate::error::ConflictError;
use crate::world::housing::{House, Town};
use crate::world::map::MapStore;
use crate::world::position::Position;
use crate::world::spawns::Spawn;
use crate::world::tile::Tile;
use crate::world::waypoints::{waypoint_key, Waypoint};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of a committed batch: concrete before/after states in both directions.
///
/// `forward` and `inverse` only contain whole-state changes (`ReplaceTile`,
/// `SetHouse`, `SetTown`, `SetWaypoint`, `SetSpawn`), table changes first, so
/// replaying either one is deterministic on any replica holding the same state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    pub id: BatchId,
    pub forward: ChangeBatch,
    pub inverse: ChangeBatch,
    pub touched: BTreeSet<Position>,
}

impl AppliedBatch {
    pub fn is_noop(&self) -> bool {
        self.forward.is_empty()
    }
}

impl MapStore {
    /// Applies `batch` atomically: either every change lands or the store is untouched.
    pub fn apply(&mut self, batch: &ChangeBatch) -> Result<AppliedBatch, ConflictError> {
        let mut staging = Staging::new(self);
        for change in &batch.changes {
            staging.stage(change)?;
        }
        staging.validate()?;
        let diff = staging.into_diff();
        self.commit(batch.id, diff)
    }

    /// Tiles a batch may write: direct targets plus members of removed houses.
    pub fn touched_by(&self, batch: &ChangeBatch) -> BTreeSet<Position> {
        let mut touched = batch.direct_positions();
        for change in &batch.changes {
            if let Change::SetHouse { id, house: None } = change {
                touched.extend(self.house_tiles(*id));
            }
        }
        touched
    }

    fn commit(&mut self, id: BatchId, diff: Diff) -> Result<AppliedBatch, ConflictError> {
        let mut forward = Vec::new();
        let mut inverse = Vec::new();
        let mut touched = BTreeSet::new();

        for (house_id, (before, after)) in diff.houses {
            forward.push(Change::SetHouse { id: house_id, house: after.clone() });
            inverse.push(Change::SetHouse { id: house_id, house: before });
            self.put_house(house_id, after);
        }
        for (town_id, (before, after)) in diff.towns {
            forward.push(Change::SetTown { id: town_id, town: after.clone() });
            inverse.push(Change::SetTown { id: town_id, town: before });
            self.put_town(town_id, after);
        }
        for (key, (before, after)) in diff.waypoints {
            let forward_name = after
                .as_ref()
                .or(before.as_ref())
                .map(|waypoint| waypoint.name.clone())
                .unwrap_or_else(|| key.clone());
            let inverse_name = before
                .as_ref()
                .or(after.as_ref())
                .map(|waypoint| waypoint.name.clone())
                .unwrap_or_else(|| key.clone());
            forward.push(Change::SetWaypoint {
                name: forward_name,
                position: after.as_ref().map(|waypoint| waypoint.position),
            });
            inverse.push(Change::SetWaypoint {
                name: inverse_name,
                position: before.as_ref().map(|waypoint| waypoint.position),
            });
            self.put_waypoint(&key, after);
        }
        for (center, (before, after)) in diff.spawns {
            forward.push(Change::SetSpawn { center, spawn: after.clone() });
            inverse.push(Change::SetSpawn { center, spawn: before });
            self.put_spawn(center, after);
        }
        for (position, (before, after)) in diff.tiles {
            forward.push(Change::ReplaceTile { position, tile: after.clone() });
            inverse.push(Change::ReplaceTile { position, tile: before });
            touched.insert(position);
            match after {
                Some(tile) => {
                    self.put_tile(tile)?;
                }
                None => {
                    self.remove_tile(position);
                }
            }
        }

        if !forward.is_empty() {
            self.bump_revision();
        }
        Ok(AppliedBatch {
            id,
            forward: ChangeBatch::with_id(id, forward),
            inverse: ChangeBatch::new(inverse),
            touched,
        })
    }
}

type Delta<T> = (Option<T>, Option<T>);

#[derive(Default)]
struct Diff {
    tiles: BTreeMap<Position, Delta<Tile>>,
    houses: BTreeMap<u32, Delta<House>>,
    towns: BTreeMap<u32, Delta<Town>>,
    waypoints: BTreeMap<String, Delta<Waypoint>>,
    spawns: BTreeMap<Position, Delta<Spawn>>,
}

/// Copy-on-write view of the store that collects a batch before commit.
struct Staging<'a> {
    store: &'a MapStore,
    tiles: BTreeMap<Position, Option<Tile>>,
    houses: BTreeMap<u32, Option<House>>,
    towns: BTreeMap<u32, Option<Town>>,
    waypoints: BTreeMap<String, Option<Waypoint>>,
    spawns: BTreeMap<Position, Option<Spawn>>,
}

impl<'a> Staging<'a> {
    fn new(store: &'a MapStore) -> Self {
        Staging {
            store,
            tiles: BTreeMap::new(),
            houses: BTreeMap::new(),
            towns: BTreeMap::new(),
            waypoints: BTreeMap::new(),
            spawns: BTreeMap::new(),
        }
    }

    fn stage(&mut self, change: &Change) -> Result<(), ConflictError> {
        match change {
            Change::ReplaceTile { position, tile } => {
                check_position(*position)?;
                if let Some(tile) = tile {
                    for item in tile.ground.iter().chain(tile.items.iter()) {
                        check_nesting(*position, item)?;
                    }
                }
                let tile = tile.clone().map(|mut tile| {
                    tile.position = *position;
                    tile
                });
                self.tiles.insert(*position, tile);
            }
            Change::SetGround { position, ground } => {
                if let Some(ground) = ground {
                    check_nesting(*position, ground)?;
                }
                self.tile_mut(*position)?.ground = ground.clone();
            }
            Change::AddItem {
                position,
                index,
                item,
            } => {
                check_nesting(*position, item)?;
                let tile = self.tile_mut(*position)?;
                let at = index.map_or(tile.items.len(), usize::from);
                if at > tile.items.len() {
                    return Err(ConflictError::stale(
                        Some(*position),
                        format!("stack index {} beyond {} items", at, tile.items.len()),
                    ));
                }
                tile.items.insert(at, item.clone());
            }
            Change::RemoveItem { position, index } => {
                let tile = self.existing_tile_mut(*position)?;
                let at = usize::from(*index);
                if at >= tile.items.len() {
                    return Err(ConflictError::stale(
                        Some(*position),
                        format!("no item at stack index {}", at),
                    ));
                }
                tile.items.remove(at);
            }
            Change::SetItemAttribute {
                position,
                index,
                key,
                value,
            } => {
                let tile = self.existing_tile_mut(*position)?;
                let Some(item) = tile.items.get_mut(usize::from(*index)) else {
                    return Err(ConflictError::stale(
                        Some(*position),
                        format!("no item at stack index {}", index),
                    ));
                };
                item.set_attribute(key, value.clone());
            }
            Change::SetTileFlags { position, flags } => {
                self.tile_mut(*position)?.flags = *flags;
            }
            Change::SetTileHouse { position, house_id } => {
                self.tile_mut(*position)?.house_id = *house_id;
            }
            Change::SetCreature { position, creature } => {
                self.tile_mut(*position)?.creature = creature.clone();
            }
            Change::SetSpawn { center, spawn } => {
                check_position(*center)?;
                let spawn = spawn.clone().map(|mut spawn| {
                    spawn.center = *center;
                    spawn
                });
                self.spawns.insert(*center, spawn);
            }
            Change::SetHouse { id, house } => match house {
                Some(house) => {
                    let mut house = house.clone();
                    house.id = *id;
                    self.houses.insert(*id, Some(house));
                }
                None => {
                    for position in self.house_members(*id) {
                        self.tile_mut(position)?.house_id = None;
                    }
                    self.houses.insert(*id, None);
                }
            },
            Change::SetTown { id, town } => {
                let town = town.clone().map(|mut town| {
                    town.id = *id;
                    town
                });
                self.towns.insert(*id, town);
            }
            Change::SetWaypoint { name, position } => {
                let waypoint = match position {
                    Some(position) => {
                        check_position(*position)?;
                        Some(Waypoint {
                            name: name.clone(),
                            position: *position,
                        })
                    }
                    None => None,
                };
                self.waypoints.insert(waypoint_key(name), waypoint);
            }
        }
        Ok(())
    }

    fn tile(&self, position: Position) -> Option<&Tile> {
        match self.tiles.get(&position) {
            Some(staged) => staged.as_ref(),
            None => self.store.tile(position),
        }
    }

    fn tile_mut(&mut self, position: Position) -> Result<&mut Tile, ConflictError> {
        check_position(position)?;
        let store = self.store;
        let slot = self
            .tiles
            .entry(position)
            .or_insert_with(|| store.tile(position).cloned());
        Ok(slot.get_or_insert_with(|| Tile::new(position)))
    }

    fn existing_tile_mut(&mut self, position: Position) -> Result<&mut Tile, ConflictError> {
        if self.tile(position).is_none() {
            return Err(ConflictError::stale(Some(position), "tile does not exist"));
        }
        self.tile_mut(position)
    }

    fn house_exists(&self, id: u32) -> bool {
        match self.houses.get(&id) {
            Some(staged) => staged.is_some(),
            None => self.store.house(id).is_some(),
        }
    }

    fn house_members(&self, id: u32) -> BTreeSet<Position> {
        let mut members: BTreeSet<Position> = self
            .store
            .house_tiles(id)
            .filter(|position| !self.tiles.contains_key(position))
            .collect();
        for (position, tile) in &self.tiles {
            if tile.as_ref().and_then(|tile| tile.house_id) == Some(id) {
                members.insert(*position);
            }
        }
        members
    }

    /// Every tile whose house reference changed must point at a live house.
    fn validate(&self) -> Result<(), ConflictError> {
        for (position, staged) in &self.tiles {
            let Some(house_id) = staged.as_ref().and_then(|tile| tile.house_id) else {
                continue;
            };
            let unchanged = self
                .store
                .tile(*position)
                .and_then(|tile| tile.house_id)
                == Some(house_id);
            if unchanged && !self.houses.contains_key(&house_id) {
                continue;
            }
            if !self.house_exists(house_id) {
                return Err(ConflictError::stale(
                    Some(*position),
                    format!("house {} does not exist", house_id),
                ));
            }
        }
        Ok(())
    }

    fn into_diff(self) -> Diff {
        let store = self.store;
        let mut diff = Diff::default();
        for (position, after) in self.tiles {
            let after = after.filter(|tile| !tile.is_empty());
            let before = store.tile(position).cloned();
            if before != after {
                diff.tiles.insert(position, (before, after));
            }
        }
        for (id, after) in self.houses {
            let before = store.house(id).cloned();
            if before != after {
                diff.houses.insert(id, (before, after));
            }
        }
        for (id, after) in self.towns {
            let before = store.town(id).cloned();
            if before != after {
                diff.towns.insert(id, (before, after));
            }
        }
        for (key, after) in self.waypoints {
            let before = store.waypoints().get(&key).cloned();
            if before != after {
                diff.waypoints.insert(key, (before, after));
            }
        }
        for (center, after) in self.spawns {
            let before = store.spawns().get(&center).cloned();
            if before != after {
                diff.spawns.insert(center, (before, after));
            }
        }
        diff
    }
}

fn check_position(position: Position) -> Result<(), ConflictError> {
    if position.is_valid() {
        Ok(())
    } else {
        Err(ConflictError::OutOfBounds(position))
    }
}

fn check_nesting(position: Position, item: &Item) -> Result<(), ConflictError> {
    let depth = item.nesting_depth();
    if depth > MAX_CONTAINER_DEPTH {
        return Err(ConflictError::stale(
            Some(position),
            format!("containers nested {} deep, limit is {}", depth, MAX_CONTAINER_DEPTH),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::entities::creature::Creature;
    use crate::entities::item::{AttributeValue, ATTR_ACTION_ID};
    use crate::world::tile::TileFlags;

    fn p(x: u16, y: u16) -> Position {
        Position::new(x, y, 7)
    }

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (*state >> 32) as u32
    }

    fn sample_map() -> MapStore {
        let mut map = MapStore::new(512, 512);
        map.put_house(3, Some(House::new(3, "Old Mill", 1)));
        map.put_town(1, Some(Town::new(1, "Riverbend", p(50, 50))));
        for x in 10..14 {
            let mut tile = Tile::new(p(x, 10))
                .with_ground(Item::new(4526))
                .with_item(Item::new(1987).with_contents(vec![Item::with_count(2148, 30)]));
            if x < 12 {
                tile.house_id = Some(3);
            }
            map.put_tile(tile).expect("put");
        }
        map
    }

    fn snapshot(map: &MapStore) -> Vec<u8> {
        codec::encode_to_vec(map).expect("encode")
    }

    #[test]
    fn inverse_restores_exact_bytes() {
        let mut map = sample_map();
        let before = snapshot(&map);
        let batch = ChangeBatch::new(vec![
            Change::AddItem {
                position: p(10, 10),
                index: Some(0),
                item: Item::new(100),
            },
            Change::RemoveItem {
                position: p(13, 10),
                index: 0,
            },
            Change::SetItemAttribute {
                position: p(11, 10),
                index: 0,
                key: ATTR_ACTION_ID.to_string(),
                value: Some(AttributeValue::Int(4001)),
            },
            Change::SetTileFlags {
                position: p(40, 40),
                flags: TileFlags::PROTECTION_ZONE,
            },
            Change::SetCreature {
                position: p(12, 10),
                creature: Some(Creature::new("Rat")),
            },
            Change::SetWaypoint {
                name: "Mill".to_string(),
                position: Some(p(10, 10)),
            },
        ]);
        let applied = map.apply(&batch).expect("apply");
        assert_ne!(snapshot(&map), before);
        assert_eq!(map.tile(p(10, 10)).map(|tile| tile.items[0].type_id.0), Some(100));

        map.apply(&applied.inverse).expect("undo");
        assert_eq!(snapshot(&map), before);
        assert!(map.tile(p(40, 40)).is_none());
    }

    #[test]
    fn failing_change_leaves_store_untouched() {
        let mut map = sample_map();
        let before = map.clone();
        let batch = ChangeBatch::new(vec![
            Change::AddItem {
                position: p(10, 10),
                index: None,
                item: Item::new(100),
            },
            Change::RemoveItem {
                position: p(10, 10),
                index: 9,
            },
        ]);
        let err = map.apply(&batch).unwrap_err();
        assert!(matches!(err, ConflictError::StaleVersion { .. }));
        assert_eq!(map, before);
        assert_eq!(map.revision(), before.revision());
    }

    #[test]
    fn item_edit_on_missing_tile_is_stale() {
        let mut map = sample_map();
        let err = map
            .apply(&ChangeBatch::single(Change::RemoveItem {
                position: p(300, 300),
                index: 0,
            }))
            .unwrap_err();
        assert_eq!(err.position(), Some(p(300, 300)));
    }

    #[test]
    fn out_of_range_floor_is_rejected() {
        let mut map = sample_map();
        let bad = Position::new(1, 1, 16);
        let err = map
            .apply(&ChangeBatch::single(Change::SetGround {
                position: bad,
                ground: Some(Item::new(1)),
            }))
            .unwrap_err();
        assert_eq!(err, ConflictError::OutOfBounds(bad));
    }

    #[test]
    fn removing_house_clears_members_and_undo_restores() {
        let mut map = sample_map();
        let before = map.clone();
        let batch = ChangeBatch::single(Change::SetHouse { id: 3, house: None });
        assert_eq!(
            map.touched_by(&batch).into_iter().collect::<Vec<_>>(),
            vec![p(10, 10), p(11, 10)]
        );
        let applied = map.apply(&batch).expect("apply");
        assert!(map.house(3).is_none());
        assert_eq!(map.house_tiles(3).count(), 0);
        assert_eq!(map.tile(p(10, 10)).and_then(|tile| tile.house_id), None);
        assert_eq!(applied.touched.len(), 2);
        assert!(matches!(applied.forward.changes[0], Change::SetHouse { .. }));

        map.apply(&applied.inverse).expect("undo");
        assert_eq!(map, before);
        assert_eq!(map.house_tiles(3).count(), 2);
    }

    #[test]
    fn tile_cannot_reference_missing_house() {
        let mut map = sample_map();
        let err = map
            .apply(&ChangeBatch::single(Change::SetTileHouse {
                position: p(13, 10),
                house_id: Some(99),
            }))
            .unwrap_err();
        assert!(matches!(err, ConflictError::StaleVersion { .. }));

        let batch = ChangeBatch::new(vec![
            Change::SetTileHouse {
                position: p(13, 10),
                house_id: Some(99),
            },
            Change::SetHouse {
                id: 99,
                house: Some(House::new(99, "New Build", 1)),
            },
        ]);
        map.apply(&batch).expect("house created in same batch");
        assert_eq!(map.house_tiles(99).collect::<Vec<_>>(), vec![p(13, 10)]);
    }

    #[test]
    fn forward_replays_identically_on_replica() {
        let mut origin = sample_map();
        let mut replica = origin.clone();
        let applied = origin
            .apply(&ChangeBatch::new(vec![
                Change::AddItem {
                    position: p(12, 10),
                    index: None,
                    item: Item::new(555),
                },
                Change::SetTown {
                    id: 2,
                    town: Some(Town::new(2, "Hillcrest", p(60, 60))),
                },
            ]))
            .expect("apply");
        replica.apply(&applied.forward).expect("replay");
        assert_eq!(origin, replica);
    }

    fn nested(depth: usize) -> Item {
        let mut item = Item::new(1);
        for _ in 0..depth {
            item = Item::new(1987).with_contents(vec![item]);
        }
        item
    }

    #[test]
    fn container_nesting_is_capped_for_every_item_path() {
        let mut map = sample_map();
        let before = map.clone();
        let too_deep = nested(MAX_CONTAINER_DEPTH + 1);
        let attempts = [
            Change::AddItem {
                position: p(20, 20),
                index: None,
                item: too_deep.clone(),
            },
            Change::SetGround {
                position: p(20, 20),
                ground: Some(too_deep.clone()),
            },
            Change::ReplaceTile {
                position: p(20, 20),
                tile: Some(Tile::new(p(20, 20)).with_item(too_deep)),
            },
        ];
        for change in attempts {
            let err = map.apply(&ChangeBatch::single(change)).unwrap_err();
            assert!(matches!(err, ConflictError::StaleVersion { position: Some(at), .. } if at == p(20, 20)));
            assert_eq!(map, before);
        }

        map.apply(&ChangeBatch::single(Change::AddItem {
            position: p(20, 20),
            index: None,
            item: nested(MAX_CONTAINER_DEPTH),
        }))
        .expect("deepest allowed");
        let reloaded = codec::decode_slice(&snapshot(&map)).expect("reload");
        assert_eq!(reloaded, map);
    }

    #[test]
    fn noop_batch_does_not_bump_revision() {
        let mut map = sample_map();
        let revision = map.revision();
        let applied = map
            .apply(&ChangeBatch::single(Change::SetTileFlags {
                position: p(10, 10),
                flags: TileFlags::default(),
            }))
            .expect("apply");
        assert!(applied.is_noop());
        assert_eq!(map.revision(), revision);
    }

    #[test]
    fn random_batches_undo_cleanly() {
        let mut state = 0xdead_beef_0bad_f00d;
        let mut map = sample_map();
        for _ in 0..64 {
            let before = snapshot(&map);
            let mut changes = Vec::new();
            for _ in 0..(1 + lcg_next(&mut state) % 5) {
                let position = p(8 + (lcg_next(&mut state) % 8) as u16, 10);
                let change = match lcg_next(&mut state) % 4 {
                    0 => Change::AddItem {
                        position,
                        index: None,
                        item: Item::with_count(2148, (lcg_next(&mut state) % 100) as u16),
                    },
                    1 => Change::SetGround {
                        position,
                        ground: None,
                    },
                    2 => Change::SetTileFlags {
                        position,
                        flags: TileFlags(lcg_next(&mut state) & 0x3d),
                    },
                    _ => Change::ReplaceTile {
                        position,
                        tile: None,
                    },
                };
                changes.push(change);
            }
            let Ok(applied) = map.apply(&ChangeBatch::new(changes)) else {
                assert_eq!(snapshot(&map), before);
                continue;
            };
            let after = snapshot(&map);
            map.apply(&applied.inverse).expect("undo");
            assert_eq!(snapshot(&map), before);
            map.apply(&applied.forward).expect("redo");
            assert_eq!(snapshot(&map), after);
        }
    }
}
