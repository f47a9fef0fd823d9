pub mod autosave;
pub mod mapfile;

pub use mapfile::{backup_path, load_map, save_map};
