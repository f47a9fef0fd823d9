//! Typed attribute lists carried in node properties.
//!
//! Version 4 frames every attribute as `{type u8}{len}{payload}` so readers can
//! step over types they do not know. Older versions leave the length implicit,
//! which makes an unknown attribute impossible to skip.

use crate::codec::need;
use crate::entities::item::{
    AttributeValue, Item, ATTR_ACTION_ID, ATTR_DEPOT_ID, ATTR_DESCRIPTION, ATTR_DOOR_ID,
    ATTR_TELEPORT, ATTR_TEXT, ATTR_UNIQUE_ID,
};
use crate::error::CodecError;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::world::map::MapMetadata;
use crate::world::tile::{Tile, TileFlags};
use std::collections::BTreeMap;

pub const ATTR_MAP_DESCRIPTION: u8 = 1;
pub const ATTR_TILE_FLAGS: u8 = 3;
pub const ATTR_ITEM_ACTION_ID: u8 = 4;
pub const ATTR_ITEM_UNIQUE_ID: u8 = 5;
pub const ATTR_ITEM_TEXT: u8 = 6;
pub const ATTR_ITEM_DESC: u8 = 7;
pub const ATTR_TELE_DEST: u8 = 8;
pub const ATTR_GROUND_ITEM: u8 = 9;
pub const ATTR_ITEM_DEPOT_ID: u8 = 10;
pub const ATTR_EXT_SPAWN_FILE: u8 = 11;
pub const ATTR_EXT_HOUSE_FILE: u8 = 13;
pub const ATTR_HOUSE_DOOR_ID: u8 = 14;
pub const ATTR_COUNT: u8 = 15;
pub const ATTR_ATTRIBUTE_MAP: u8 = 128;

const TAG_STR: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_POSITION: u8 = 3;

/// Attribute framing in effect for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Framed,
    Legacy,
}

impl Framing {
    pub fn for_version(version: u32) -> Self {
        if version >= 4 {
            Framing::Framed
        } else {
            Framing::Legacy
        }
    }
}

fn write_attr(out: &mut PacketWriter, attr: u8, payload: impl FnOnce(&mut PacketWriter)) {
    let mut body = PacketWriter::new();
    payload(&mut body);
    out.write_u8(attr);
    out.write_len_prefixed(body.len());
    out.write_bytes(body.as_slice());
}

/// Walks an attribute list; `handle` returns false for types it does not know.
fn read_attrs<'a>(
    reader: &mut PacketReader<'a>,
    framing: Framing,
    mut handle: impl FnMut(u8, &mut PacketReader<'a>) -> Result<bool, CodecError>,
) -> Result<(), CodecError> {
    while !reader.is_empty() {
        let attr = need(reader.read_u8())?;
        match framing {
            Framing::Framed => {
                let len = need(reader.read_len_prefixed())?;
                let mut payload = PacketReader::new(need(reader.read_bytes(len))?);
                if !handle(attr, &mut payload)? {
                    log::debug!("skipping unknown attribute 0x{:02x} ({} bytes)", attr, len);
                }
            }
            Framing::Legacy => {
                if !handle(attr, reader)? {
                    return Err(CodecError::corrupt(format!(
                        "unknown attribute 0x{:02x} in legacy data",
                        attr
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Writes attributes the format has a dedicated type for; false means the
/// value must go through the generic attribute map.
fn write_dedicated(out: &mut PacketWriter, key: &str, value: &AttributeValue) -> bool {
    let small = value.as_int().and_then(|value| u16::try_from(value).ok());
    match (key, value, small) {
        (ATTR_ACTION_ID, _, Some(id)) => {
            write_attr(out, ATTR_ITEM_ACTION_ID, |body| body.write_u16_le(id))
        }
        (ATTR_UNIQUE_ID, _, Some(id)) => {
            write_attr(out, ATTR_ITEM_UNIQUE_ID, |body| body.write_u16_le(id))
        }
        (ATTR_DEPOT_ID, _, Some(id)) => {
            write_attr(out, ATTR_ITEM_DEPOT_ID, |body| body.write_u16_le(id))
        }
        (ATTR_DOOR_ID, _, Some(id)) if id <= 0xff => {
            write_attr(out, ATTR_HOUSE_DOOR_ID, |body| body.write_u8(id as u8))
        }
        (ATTR_TEXT, AttributeValue::Str(text), _) => {
            write_attr(out, ATTR_ITEM_TEXT, |body| body.write_string_str(text))
        }
        (ATTR_DESCRIPTION, AttributeValue::Str(text), _) => {
            write_attr(out, ATTR_ITEM_DESC, |body| body.write_string_str(text))
        }
        (ATTR_TELEPORT, AttributeValue::Position(position), _) => {
            write_attr(out, ATTR_TELE_DEST, |body| body.write_position(*position))
        }
        _ => return false,
    }
    true
}

/// The generic attribute map counts its entries in a u16.
pub const MAX_GENERIC_ATTRIBUTES: usize = u16::MAX as usize;

pub(crate) fn write_item_props(out: &mut PacketWriter, item: &Item) -> Result<(), CodecError> {
    out.write_u16_le(item.type_id.0);
    if let Some(count) = item.count {
        write_attr(out, ATTR_COUNT, |body| body.write_u16_le(count));
    }

    let extra: Vec<(&String, &AttributeValue)> = item
        .attributes
        .iter()
        .filter(|(key, value)| !write_dedicated(out, key, value))
        .collect();
    let count = u16::try_from(extra.len()).map_err(|_| {
        CodecError::Unencodable(format!(
            "item {} has {} generic attributes, at most {} fit",
            item.type_id.0,
            extra.len(),
            MAX_GENERIC_ATTRIBUTES
        ))
    })?;

    if !extra.is_empty() {
        write_attr(out, ATTR_ATTRIBUTE_MAP, |body| {
            body.write_u16_le(count);
            for (key, value) in extra {
                body.write_string_str(key);
                match value {
                    AttributeValue::Str(text) => {
                        body.write_u8(TAG_STR);
                        body.write_string_str(text);
                    }
                    AttributeValue::Int(value) => {
                        body.write_u8(TAG_INT);
                        body.write_i32_le(*value);
                    }
                    AttributeValue::Position(position) => {
                        body.write_u8(TAG_POSITION);
                        body.write_position(*position);
                    }
                }
            }
        });
    }
    Ok(())
}

pub(crate) fn read_item_props(props: &[u8], framing: Framing) -> Result<Item, CodecError> {
    let mut reader = PacketReader::new(props);
    let mut item = Item::new(need(reader.read_u16_le())?);
    read_attrs(&mut reader, framing, |attr, payload| {
        match attr {
            ATTR_COUNT => {
                let count = match framing {
                    Framing::Framed => need(payload.read_u16_le())?,
                    Framing::Legacy => u16::from(need(payload.read_u8())?),
                };
                item.count = Some(count);
            }
            ATTR_ITEM_ACTION_ID => {
                let id = need(payload.read_u16_le())?;
                item.set_attribute(ATTR_ACTION_ID, Some(AttributeValue::Int(i32::from(id))));
            }
            ATTR_ITEM_UNIQUE_ID => {
                let id = need(payload.read_u16_le())?;
                item.set_attribute(ATTR_UNIQUE_ID, Some(AttributeValue::Int(i32::from(id))));
            }
            ATTR_ITEM_DEPOT_ID => {
                let id = need(payload.read_u16_le())?;
                item.set_attribute(ATTR_DEPOT_ID, Some(AttributeValue::Int(i32::from(id))));
            }
            ATTR_HOUSE_DOOR_ID => {
                let id = need(payload.read_u8())?;
                item.set_attribute(ATTR_DOOR_ID, Some(AttributeValue::Int(i32::from(id))));
            }
            ATTR_ITEM_TEXT => {
                let text = need(payload.read_string_lossy())?;
                item.set_attribute(ATTR_TEXT, Some(AttributeValue::Str(text)));
            }
            ATTR_ITEM_DESC => {
                let text = need(payload.read_string_lossy())?;
                item.set_attribute(ATTR_DESCRIPTION, Some(AttributeValue::Str(text)));
            }
            ATTR_TELE_DEST => {
                let position = need(payload.read_position())?;
                item.set_attribute(ATTR_TELEPORT, Some(AttributeValue::Position(position)));
            }
            ATTR_ATTRIBUTE_MAP => {
                for (key, value) in read_attribute_map(payload)? {
                    item.attributes.insert(key, value);
                }
            }
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(item)
}

fn read_attribute_map(
    reader: &mut PacketReader<'_>,
) -> Result<BTreeMap<String, AttributeValue>, CodecError> {
    let count = need(reader.read_u16_le())?;
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let key = need(reader.read_string_lossy())?;
        let value = match need(reader.read_u8())? {
            TAG_STR => AttributeValue::Str(need(reader.read_string_lossy())?),
            TAG_INT => AttributeValue::Int(need(reader.read_i32_le())?),
            TAG_POSITION => AttributeValue::Position(need(reader.read_position())?),
            tag => {
                return Err(CodecError::corrupt(format!(
                    "attribute '{}' has unknown value tag {}",
                    key, tag
                )))
            }
        };
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Tile attributes after the coordinate prefix. A plain ground is stored inline.
pub(crate) fn write_tile_attrs(out: &mut PacketWriter, tile: &Tile) {
    if !tile.flags.is_empty() {
        let flags = tile.flags.0;
        write_attr(out, ATTR_TILE_FLAGS, |body| body.write_u32_le(flags));
    }
    if let Some(ground) = tile.ground.as_ref().filter(|ground| ground.is_plain()) {
        let id = ground.type_id.0;
        write_attr(out, ATTR_GROUND_ITEM, |body| body.write_u16_le(id));
    }
}

pub(crate) fn read_tile_attrs(
    reader: &mut PacketReader<'_>,
    framing: Framing,
    tile: &mut Tile,
) -> Result<(), CodecError> {
    read_attrs(reader, framing, |attr, payload| {
        match attr {
            ATTR_TILE_FLAGS => tile.flags = TileFlags(need(payload.read_u32_le())?),
            ATTR_GROUND_ITEM => tile.ground = Some(Item::new(need(payload.read_u16_le())?)),
            _ => return Ok(false),
        }
        Ok(true)
    })
}

pub(crate) fn write_map_data_attrs(out: &mut PacketWriter, metadata: &MapMetadata) {
    for (attr, text) in [
        (ATTR_MAP_DESCRIPTION, &metadata.description),
        (ATTR_EXT_SPAWN_FILE, &metadata.spawn_file),
        (ATTR_EXT_HOUSE_FILE, &metadata.house_file),
    ] {
        if !text.is_empty() {
            write_attr(out, attr, |body| body.write_string_str(text));
        }
    }
}

pub(crate) fn read_map_data_attrs(
    props: &[u8],
    framing: Framing,
    metadata: &mut MapMetadata,
) -> Result<(), CodecError> {
    let mut reader = PacketReader::new(props);
    read_attrs(&mut reader, framing, |attr, payload| {
        let slot = match attr {
            ATTR_MAP_DESCRIPTION => &mut metadata.description,
            ATTR_EXT_SPAWN_FILE => &mut metadata.spawn_file,
            ATTR_EXT_HOUSE_FILE => &mut metadata.house_file,
            _ => return Ok(false),
        };
        let text = need(payload.read_string_lossy())?;
        // Older files repeat the description attribute once per line.
        if attr == ATTR_MAP_DESCRIPTION && !slot.is_empty() {
            slot.push('\n');
            slot.push_str(&text);
        } else {
            *slot = text;
        }
        Ok(true)
    })
}
