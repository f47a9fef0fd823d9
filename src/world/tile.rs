use crate::entities::creature::Creature;
use crate::entities::item::Item;
use crate::world::position::Position;

/// Tile map flags, stored as the on-disk bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileFlags(pub u32);

impl TileFlags {
    pub const PROTECTION_ZONE: TileFlags = TileFlags(0x01);
    pub const NO_PVP: TileFlags = TileFlags(0x04);
    pub const NO_LOGOUT: TileFlags = TileFlags(0x08);
    pub const PVP_ZONE: TileFlags = TileFlags(0x10);
    pub const REFRESH: TileFlags = TileFlags(0x20);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: TileFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: TileFlags) -> TileFlags {
        TileFlags(self.0 | other.0)
    }

    pub fn without(self, other: TileFlags) -> TileFlags {
        TileFlags(self.0 & !other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub position: Position,
    pub ground: Option<Item>,
    /// Stacking order, bottom to top.
    pub items: Vec<Item>,
    pub creature: Option<Creature>,
    pub flags: TileFlags,
    /// Weak reference into the house table.
    pub house_id: Option<u32>,
}

impl Tile {
    pub fn new(position: Position) -> Self {
        Tile {
            position,
            ground: None,
            items: Vec::new(),
            creature: None,
            flags: TileFlags::default(),
            house_id: None,
        }
    }

    pub fn with_ground(mut self, ground: Item) -> Self {
        self.ground = Some(ground);
        self
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ground.is_none()
            && self.items.is_empty()
            && self.creature.is_none()
            && self.flags.is_empty()
            && self.house_id.is_none()
    }

    pub fn is_house_tile(&self) -> bool {
        self.house_id.is_some()
    }

    /// Every item on the tile including ground and container contents.
    pub fn item_count(&self) -> usize {
        self.ground.iter().chain(self.items.iter()).map(Item::total_count).sum()
    }

    pub fn top_item(&self) -> Option<&Item> {
        self.items.last().or(self.ground.as_ref())
    }
}
