pub mod housing;
pub mod map;
pub mod position;
pub mod region;
pub mod sector;
pub mod spawns;
pub mod tile;
pub mod waypoints;

pub use map::MapStore;
pub use position::Position;
pub use region::Region;
pub use tile::Tile;
