use crate::codec;
use crate::error::CodecError;
use crate::world::map::MapStore;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where the previous version of a map is kept after a save.
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".bak")
}

fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

/// Saves `store` so that a crash at any point leaves either the old or the
/// new file in place: write a sibling temp file, sync it, keep the old file
/// as `.bak`, then rename over the target.
pub fn save_map(path: &Path, store: &MapStore) -> Result<u64, CodecError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_path(path);
    let written = write_temp(&temp, store);
    let written = match written {
        Ok(written) => written,
        Err(err) => {
            if let Err(cleanup) = fs::remove_file(&temp) {
                log::debug!("could not remove {}: {}", temp.display(), cleanup);
            }
            return Err(err);
        }
    };
    if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup)?;
    }
    fs::rename(&temp, path)?;
    log::info!(
        "saved {} ({} tiles, {} bytes)",
        path.display(),
        store.tile_count(),
        written
    );
    Ok(written)
}

fn write_temp(temp: &Path, store: &MapStore) -> Result<u64, CodecError> {
    let file = File::create(temp)?;
    let mut writer = BufWriter::new(file);
    codec::encode(store, &mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|err| CodecError::Io(err.into_error()))?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

pub fn load_map(path: &Path) -> Result<MapStore, CodecError> {
    let file = File::open(path)?;
    let store = codec::decode(file)?;
    log::info!(
        "loaded {} (format {}, {} tiles, {} houses)",
        path.display(),
        store.metadata().version,
        store.tile_count(),
        store.houses().len()
    );
    Ok(store)
}
