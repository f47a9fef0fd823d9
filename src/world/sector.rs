use crate::error::ConflictError;
use crate::world::position::Position;
use crate::world::region::Region;
use crate::world::tile::Tile;
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::Bound;

pub const SECTOR_SHIFT: u16 = 5;
pub const SECTOR_SIZE: u16 = 1 << SECTOR_SHIFT;
const SECTOR_MASK: u16 = SECTOR_SIZE - 1;
const SECTOR_SLOTS: usize = (SECTOR_SIZE as usize) * (SECTOR_SIZE as usize);

pub const DEFAULT_VACANT_POOL: usize = 64;

/// Sector coordinates. Field order makes the derived ordering floor, row, column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorKey {
    pub z: u8,
    pub y: u16,
    pub x: u16,
}

impl From<Position> for SectorKey {
    fn from(position: Position) -> Self {
        SectorKey {
            z: position.z,
            y: position.y >> SECTOR_SHIFT,
            x: position.x >> SECTOR_SHIFT,
        }
    }
}

#[derive(Debug, Clone)]
struct Sector {
    tiles: Vec<Option<Box<Tile>>>,
    live: usize,
}

impl Sector {
    fn new() -> Self {
        Sector {
            tiles: vec![None; SECTOR_SLOTS],
            live: 0,
        }
    }

    fn slot(position: Position) -> usize {
        usize::from(position.y & SECTOR_MASK) * usize::from(SECTOR_SIZE)
            + usize::from(position.x & SECTOR_MASK)
    }
}

/// Sector bookkeeping counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub sectors_allocated: u64,
    pub sectors_reused: u64,
    pub sectors_parked: u64,
    pub sectors_reclaimed: u64,
}

/// Sparse 3-D tile index paged into 32x32 sectors per floor.
///
/// Empty sectors leave the index immediately and wait in a bounded LRU pool
/// so a burst of place/remove edits does not reallocate; anything pushed out
/// of the pool is freed.
pub struct TileIndex {
    sectors: BTreeMap<SectorKey, Box<Sector>>,
    vacant: LruCache<SectorKey, Box<Sector>>,
    len: usize,
    stats: IndexStats,
}

impl TileIndex {
    pub fn new(vacant_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(vacant_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        TileIndex {
            sectors: BTreeMap::new(),
            vacant: LruCache::new(capacity),
            len: 0,
            stats: IndexStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn vacant_count(&self) -> usize {
        self.vacant.len()
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    pub fn get(&self, position: Position) -> Option<&Tile> {
        let sector = self.sectors.get(&SectorKey::from(position))?;
        sector.tiles[Sector::slot(position)].as_deref()
    }

    pub fn get_mut(&mut self, position: Position) -> Option<&mut Tile> {
        let sector = self.sectors.get_mut(&SectorKey::from(position))?;
        sector.tiles[Sector::slot(position)].as_deref_mut()
    }

    pub fn get_or_create(&mut self, position: Position) -> Result<&mut Tile, ConflictError> {
        if !position.is_valid() {
            return Err(ConflictError::OutOfBounds(position));
        }
        let key = SectorKey::from(position);
        if !self.sectors.contains_key(&key) {
            let sector = self.take_vacant(key);
            self.sectors.insert(key, sector);
        }
        let Some(sector) = self.sectors.get_mut(&key) else {
            return Err(ConflictError::OutOfBounds(position));
        };
        let slot = &mut sector.tiles[Sector::slot(position)];
        if slot.is_none() {
            *slot = Some(Box::new(Tile::new(position)));
            sector.live += 1;
            self.len += 1;
        }
        match slot.as_deref_mut() {
            Some(tile) => Ok(tile),
            None => Err(ConflictError::OutOfBounds(position)),
        }
    }

    /// Stores `tile` at its own position, returning whatever it replaced.
    pub fn insert(&mut self, tile: Tile) -> Result<Option<Tile>, ConflictError> {
        let position = tile.position;
        let previous = self.get(position).cloned();
        let slot = self.get_or_create(position)?;
        *slot = tile;
        Ok(previous)
    }

    pub fn erase(&mut self, position: Position) -> Option<Tile> {
        let key = SectorKey::from(position);
        let sector = self.sectors.get_mut(&key)?;
        let removed = sector.tiles[Sector::slot(position)].take()?;
        sector.live -= 1;
        self.len -= 1;
        if sector.live == 0 {
            if let Some(sector) = self.sectors.remove(&key) {
                self.park(key, sector);
            }
        }
        Some(*removed)
    }

    pub fn clear(&mut self) {
        self.sectors.clear();
        self.vacant.clear();
        self.len = 0;
    }

    /// Tiles ordered by floor, row, then column; optionally limited to `region`.
    pub fn iter(&self, region: Option<Region>) -> Tiles<'_> {
        Tiles {
            index: self,
            region,
            row: None,
            row_sectors: Vec::new(),
            cursor: 0,
            local_y: 0,
            local_x: 0,
        }
    }

    fn take_vacant(&mut self, key: SectorKey) -> Box<Sector> {
        let reused = self
            .vacant
            .pop(&key)
            .or_else(|| self.vacant.pop_lru().map(|(_, sector)| sector));
        match reused {
            Some(sector) => {
                self.stats.sectors_reused += 1;
                sector
            }
            None => {
                self.stats.sectors_allocated += 1;
                Box::new(Sector::new())
            }
        }
    }

    fn park(&mut self, key: SectorKey, sector: Box<Sector>) {
        self.stats.sectors_parked += 1;
        if self.vacant.push(key, sector).is_some() {
            self.stats.sectors_reclaimed += 1;
        }
    }
}

impl Clone for TileIndex {
    fn clone(&self) -> Self {
        TileIndex {
            sectors: self.sectors.clone(),
            vacant: LruCache::new(self.vacant.cap()),
            len: self.len,
            stats: self.stats.clone(),
        }
    }
}

impl std::fmt::Debug for TileIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileIndex")
            .field("tiles", &self.len)
            .field("sectors", &self.sectors.len())
            .field("vacant", &self.vacant.len())
            .finish()
    }
}

/// Lazy tile walk; walks one row of sectors at a time so output is (z, y, x) ordered.
pub struct Tiles<'a> {
    index: &'a TileIndex,
    region: Option<Region>,
    row: Option<(u8, u16)>,
    row_sectors: Vec<&'a Sector>,
    cursor: usize,
    local_y: u16,
    local_x: u16,
}

/// What a region walk does with the first stored sector row at or after its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowStep {
    Visit,
    SeekTo(SectorKey),
    Done,
}

fn row_step(region: Option<Region>, z: u8, y: u16) -> RowStep {
    let Some(region) = region else {
        return RowStep::Visit;
    };
    let first_row = region.min.y >> SECTOR_SHIFT;
    let last_row = region.max.y >> SECTOR_SHIFT;
    if z > region.max.z {
        RowStep::Done
    } else if z < region.min.z || y < first_row {
        RowStep::SeekTo(SectorKey {
            z: z.max(region.min.z),
            y: first_row,
            x: 0,
        })
    } else if y > last_row {
        if z == region.max.z {
            RowStep::Done
        } else {
            RowStep::SeekTo(SectorKey {
                z: z + 1,
                y: first_row,
                x: 0,
            })
        }
    } else {
        RowStep::Visit
    }
}

impl<'a> Tiles<'a> {
    /// Loads the next sector row that has at least one sector inside the region.
    /// Rows above or below the region are skipped with a single seek per floor.
    fn advance_row(&mut self) -> bool {
        let index = self.index;
        let (first_column, last_column) = match self.region {
            Some(region) => (region.min.x >> SECTOR_SHIFT, region.max.x >> SECTOR_SHIFT),
            None => (0, u16::MAX),
        };
        let mut lower = match (self.row, self.region) {
            (Some((z, y)), _) => Bound::Excluded(SectorKey { z, y, x: u16::MAX }),
            (None, Some(region)) => Bound::Included(SectorKey {
                z: region.min.z,
                y: region.min.y >> SECTOR_SHIFT,
                x: 0,
            }),
            (None, None) => Bound::Unbounded,
        };
        loop {
            let Some((next, _)) = index.sectors.range((lower, Bound::Unbounded)).next() else {
                return false;
            };
            let (z, y) = (next.z, next.y);
            match row_step(self.region, z, y) {
                RowStep::Done => return false,
                RowStep::SeekTo(key) => {
                    lower = Bound::Included(key);
                    continue;
                }
                RowStep::Visit => {}
            }
            self.row = Some((z, y));
            let start = SectorKey { z, y, x: first_column };
            let end = SectorKey { z, y, x: last_column };
            let sectors: Vec<&'a Sector> = index
                .sectors
                .range(start..=end)
                .map(|(_, sector)| sector.as_ref())
                .collect();
            if sectors.is_empty() {
                lower = Bound::Excluded(SectorKey { z, y, x: u16::MAX });
                continue;
            }
            self.row_sectors = sectors;
            self.cursor = 0;
            self.local_y = 0;
            self.local_x = 0;
            return true;
        }
    }
}

impl<'a> Iterator for Tiles<'a> {
    type Item = &'a Tile;

    fn next(&mut self) -> Option<&'a Tile> {
        loop {
            if self.row_sectors.is_empty() || self.local_y >= SECTOR_SIZE {
                self.row_sectors.clear();
                if !self.advance_row() {
                    return None;
                }
            }
            let sector = self.row_sectors[self.cursor];
            let slot = usize::from(self.local_y) * usize::from(SECTOR_SIZE)
                + usize::from(self.local_x);
            self.local_x += 1;
            if self.local_x >= SECTOR_SIZE {
                self.local_x = 0;
                self.cursor += 1;
                if self.cursor >= self.row_sectors.len() {
                    self.cursor = 0;
                    self.local_y += 1;
                }
            }
            if let Some(tile) = sector.tiles[slot].as_deref() {
                if self
                    .region
                    .map_or(true, |region| region.contains(tile.position))
                {
                    return Some(tile);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::item::Item;

    fn lcg_next(state: &mut u64) -> u32 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (*state >> 32) as u32
    }

    #[test]
    fn get_or_create_then_erase_reclaims_sector() {
        let mut index = TileIndex::new(4);
        let position = Position::new(100, 200, 7);
        index.get_or_create(position).expect("create").items.push(Item::new(100));
        assert_eq!(index.len(), 1);
        assert_eq!(index.sector_count(), 1);
        assert_eq!(index.get(position).map(|tile| tile.items.len()), Some(1));

        let removed = index.erase(position).expect("erase");
        assert_eq!(removed.position, position);
        assert_eq!(index.len(), 0);
        assert_eq!(index.sector_count(), 0);
        assert_eq!(index.vacant_count(), 1);
        assert!(index.erase(position).is_none());

        index.get_or_create(Position::new(5000, 5000, 3)).expect("create");
        assert_eq!(index.vacant_count(), 0);
        assert_eq!(index.stats().sectors_reused, 1);
    }

    #[test]
    fn vacant_pool_is_bounded() {
        let mut index = TileIndex::new(2);
        for sx in 0..5u16 {
            let position = Position::new(sx * SECTOR_SIZE, 0, 7);
            index.get_or_create(position).expect("create");
        }
        for sx in 0..5u16 {
            index.erase(Position::new(sx * SECTOR_SIZE, 0, 7));
        }
        assert_eq!(index.vacant_count(), 2);
        assert_eq!(index.stats().sectors_reclaimed, 3);
    }

    #[test]
    fn rejects_floor_outside_range() {
        let mut index = TileIndex::new(1);
        let err = index.get_or_create(Position::new(1, 1, 16)).unwrap_err();
        assert_eq!(err, ConflictError::OutOfBounds(Position::new(1, 1, 16)));
    }

    #[test]
    fn iteration_is_sorted_and_restartable() {
        let mut index = TileIndex::new(8);
        let mut state = 0x5eed_1234_abcd_0001;
        let mut expected = Vec::new();
        for _ in 0..400 {
            let position = Position::new(
                (lcg_next(&mut state) % 300) as u16,
                (lcg_next(&mut state) % 300) as u16,
                (lcg_next(&mut state) % 3) as u8 + 6,
            );
            index.get_or_create(position).expect("create");
            expected.push(position);
        }
        expected.sort();
        expected.dedup();

        let first: Vec<Position> = index.iter(None).map(|tile| tile.position).collect();
        let second: Vec<Position> = index.iter(None).map(|tile| tile.position).collect();
        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }

    #[test]
    fn region_iteration_filters() {
        let mut index = TileIndex::new(8);
        for x in 0..100u16 {
            for z in [6u8, 7] {
                index.get_or_create(Position::new(x, x, z)).expect("create");
            }
        }
        let region = Region::new(Position::new(30, 0, 7), Position::new(70, 50, 7));
        let found: Vec<Position> = index
            .iter(Some(region))
            .map(|tile| tile.position)
            .collect();
        let expected: Vec<Position> = (30..=50u16).map(|x| Position::new(x, x, 7)).collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn region_walk_seeks_past_rows_outside_the_region() {
        let region = Region::new(Position::new(0, 100, 5), Position::new(500, 200, 6));
        let first_row = 100 >> SECTOR_SHIFT;
        assert_eq!(
            row_step(Some(region), 5, 0),
            RowStep::SeekTo(SectorKey { z: 5, y: first_row, x: 0 })
        );
        assert_eq!(row_step(Some(region), 5, first_row), RowStep::Visit);
        assert_eq!(
            row_step(Some(region), 5, 400),
            RowStep::SeekTo(SectorKey { z: 6, y: first_row, x: 0 })
        );
        assert_eq!(row_step(Some(region), 6, 400), RowStep::Done);
        assert_eq!(row_step(Some(region), 9, 0), RowStep::Done);
        assert_eq!(row_step(None, 9, 0), RowStep::Visit);
    }

    #[test]
    fn region_walk_matches_a_full_scan() {
        let mut index = TileIndex::new(8);
        let mut state = 0x0dd_ba11;
        for _ in 0..600 {
            let position = Position::new(
                (lcg_next(&mut state) % 400) as u16,
                (lcg_next(&mut state) % 400) as u16,
                (lcg_next(&mut state) % 4) as u8 + 4,
            );
            index.get_or_create(position).expect("create");
        }
        let region = Region::new(Position::new(70, 90, 5), Position::new(260, 150, 6));
        let walked: Vec<Position> = index
            .iter(Some(region))
            .map(|tile| tile.position)
            .collect();
        let scanned: Vec<Position> = index
            .iter(None)
            .map(|tile| tile.position)
            .filter(|position| region.contains(*position))
            .collect();
        assert!(!scanned.is_empty());
        assert_eq!(walked, scanned);
    }
}
