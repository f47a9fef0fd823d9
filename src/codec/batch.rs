//! Change batches in node form, for replication over the wire.

use crate::codec::map_codec::{
    read_creature_props, read_house_props, read_spawn_props, read_town_props, write_creature_props,
    write_house_props, write_item_tree, write_spawn_props, write_tile, write_town_props,
    TreeDecoder,
};
use crate::codec::need;
use crate::codec::node::{
    NodeReader, NodeWriter, NODE_BATCH, NODE_CHANGE, NODE_GROUND, NODE_ITEM, NODE_TILE,
};
use crate::edit::change::{Change, ChangeBatch};
use crate::entities::item::{AttributeValue, Item};
use crate::error::CodecError;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::world::position::Position;
use crate::world::tile::{Tile, TileFlags};

const KIND_REPLACE_TILE: u8 = 1;
const KIND_SET_GROUND: u8 = 2;
const KIND_ADD_ITEM: u8 = 3;
const KIND_REMOVE_ITEM: u8 = 4;
const KIND_SET_ITEM_ATTRIBUTE: u8 = 5;
const KIND_SET_TILE_FLAGS: u8 = 6;
const KIND_SET_TILE_HOUSE: u8 = 7;
const KIND_SET_CREATURE: u8 = 8;
const KIND_SET_SPAWN: u8 = 9;
const KIND_SET_HOUSE: u8 = 10;
const KIND_SET_TOWN: u8 = 11;
const KIND_SET_WAYPOINT: u8 = 12;

const VALUE_NONE: u8 = 0;
const VALUE_STR: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_POSITION: u8 = 3;

pub fn encode_batch(batch: &ChangeBatch) -> Result<Vec<u8>, CodecError> {
    let mut nodes = NodeWriter::new(Vec::new());
    let mut props = PacketWriter::new();
    nodes.start_node(NODE_BATCH)?;
    props.write_u64_le(batch.id.0);
    nodes.write_props(props.as_slice())?;
    for change in &batch.changes {
        nodes.start_node(NODE_CHANGE)?;
        props.clear();
        write_change_props(&mut props, change);
        nodes.write_props(props.as_slice())?;
        match change {
            Change::ReplaceTile {
                tile: Some(tile),
                position,
            } => {
                let mut tile = tile.clone();
                tile.position = *position;
                write_tile(&mut nodes, &tile, &mut props)?;
            }
            Change::SetGround {
                ground: Some(ground),
                ..
            } => write_item_tree(&mut nodes, NODE_GROUND, ground)?,
            Change::AddItem { item, .. } => write_item_tree(&mut nodes, NODE_ITEM, item)?,
            _ => {}
        }
        nodes.end_node()?;
    }
    nodes.end_node()?;
    nodes.finish()
}

pub fn decode_batch(bytes: &[u8]) -> Result<ChangeBatch, CodecError> {
    let mut nodes = NodeReader::new(bytes);
    let mut decoder = TreeDecoder::new(NODE_BATCH);
    decoder.run(&mut nodes)?;
    decoder.into_batch()
}

fn write_optional_value(props: &mut PacketWriter, value: Option<&AttributeValue>) {
    match value {
        None => props.write_u8(VALUE_NONE),
        Some(AttributeValue::Str(text)) => {
            props.write_u8(VALUE_STR);
            props.write_string_str(text);
        }
        Some(AttributeValue::Int(value)) => {
            props.write_u8(VALUE_INT);
            props.write_i32_le(*value);
        }
        Some(AttributeValue::Position(position)) => {
            props.write_u8(VALUE_POSITION);
            props.write_position(*position);
        }
    }
}

fn read_optional_value(reader: &mut PacketReader<'_>) -> Result<Option<AttributeValue>, CodecError> {
    Ok(match need(reader.read_u8())? {
        VALUE_NONE => None,
        VALUE_STR => Some(AttributeValue::Str(need(reader.read_string_lossy())?)),
        VALUE_INT => Some(AttributeValue::Int(need(reader.read_i32_le())?)),
        VALUE_POSITION => Some(AttributeValue::Position(need(reader.read_position())?)),
        tag => return Err(CodecError::corrupt(format!("unknown value tag {}", tag))),
    })
}

/// Fixed fields of a change; tiles and items follow as child nodes.
fn write_change_props(props: &mut PacketWriter, change: &Change) {
    match change {
        Change::ReplaceTile { position, .. } => {
            props.write_u8(KIND_REPLACE_TILE);
            props.write_position(*position);
        }
        Change::SetGround { position, .. } => {
            props.write_u8(KIND_SET_GROUND);
            props.write_position(*position);
        }
        Change::AddItem {
            position, index, ..
        } => {
            props.write_u8(KIND_ADD_ITEM);
            props.write_position(*position);
            props.write_bool(index.is_some());
            props.write_u16_le(index.unwrap_or_default());
        }
        Change::RemoveItem { position, index } => {
            props.write_u8(KIND_REMOVE_ITEM);
            props.write_position(*position);
            props.write_u16_le(*index);
        }
        Change::SetItemAttribute {
            position,
            index,
            key,
            value,
        } => {
            props.write_u8(KIND_SET_ITEM_ATTRIBUTE);
            props.write_position(*position);
            props.write_u16_le(*index);
            props.write_string_str(key);
            write_optional_value(props, value.as_ref());
        }
        Change::SetTileFlags { position, flags } => {
            props.write_u8(KIND_SET_TILE_FLAGS);
            props.write_position(*position);
            props.write_u32_le(flags.0);
        }
        Change::SetTileHouse { position, house_id } => {
            props.write_u8(KIND_SET_TILE_HOUSE);
            props.write_position(*position);
            props.write_bool(house_id.is_some());
            props.write_u32_le(house_id.unwrap_or_default());
        }
        Change::SetCreature { position, creature } => {
            props.write_u8(KIND_SET_CREATURE);
            props.write_position(*position);
            props.write_bool(creature.is_some());
            if let Some(creature) = creature {
                write_creature_props(props, creature);
            }
        }
        Change::SetSpawn { center, spawn } => {
            props.write_u8(KIND_SET_SPAWN);
            props.write_position(*center);
            props.write_bool(spawn.is_some());
            if let Some(spawn) = spawn {
                write_spawn_props(props, spawn);
            }
        }
        Change::SetHouse { id, house } => {
            props.write_u8(KIND_SET_HOUSE);
            props.write_u32_le(*id);
            props.write_bool(house.is_some());
            if let Some(house) = house {
                write_house_props(props, house);
            }
        }
        Change::SetTown { id, town } => {
            props.write_u8(KIND_SET_TOWN);
            props.write_u32_le(*id);
            props.write_bool(town.is_some());
            if let Some(town) = town {
                write_town_props(props, town);
            }
        }
        Change::SetWaypoint { name, position } => {
            props.write_u8(KIND_SET_WAYPOINT);
            props.write_string_str(name);
            props.write_bool(position.is_some());
            props.write_position(position.unwrap_or_default());
        }
    }
}

/// A change whose fixed fields are read and whose child node may still follow.
pub(crate) struct PendingChange {
    change: Change,
    filled: bool,
}

impl PendingChange {
    pub(crate) fn read(props: &[u8]) -> Result<Self, CodecError> {
        let mut reader = PacketReader::new(props);
        let kind = need(reader.read_u8())?;
        let change = match kind {
            KIND_REPLACE_TILE => Change::ReplaceTile {
                position: need(reader.read_position())?,
                tile: None,
            },
            KIND_SET_GROUND => Change::SetGround {
                position: need(reader.read_position())?,
                ground: None,
            },
            KIND_ADD_ITEM => {
                let position = need(reader.read_position())?;
                let has_index = need(reader.read_bool())?;
                let index = need(reader.read_u16_le())?;
                Change::AddItem {
                    position,
                    index: has_index.then_some(index),
                    item: Item::new(0),
                }
            }
            KIND_REMOVE_ITEM => Change::RemoveItem {
                position: need(reader.read_position())?,
                index: need(reader.read_u16_le())?,
            },
            KIND_SET_ITEM_ATTRIBUTE => Change::SetItemAttribute {
                position: need(reader.read_position())?,
                index: need(reader.read_u16_le())?,
                key: need(reader.read_string_lossy())?,
                value: read_optional_value(&mut reader)?,
            },
            KIND_SET_TILE_FLAGS => Change::SetTileFlags {
                position: need(reader.read_position())?,
                flags: TileFlags(need(reader.read_u32_le())?),
            },
            KIND_SET_TILE_HOUSE => {
                let position = need(reader.read_position())?;
                let has_house = need(reader.read_bool())?;
                let house_id = need(reader.read_u32_le())?;
                Change::SetTileHouse {
                    position,
                    house_id: has_house.then_some(house_id),
                }
            }
            KIND_SET_CREATURE => {
                let position = need(reader.read_position())?;
                let creature = if need(reader.read_bool())? {
                    Some(read_creature_props(&mut reader)?)
                } else {
                    None
                };
                Change::SetCreature { position, creature }
            }
            KIND_SET_SPAWN => {
                let center = need(reader.read_position())?;
                let spawn = if need(reader.read_bool())? {
                    Some(read_spawn_props(&mut reader)?)
                } else {
                    None
                };
                Change::SetSpawn { center, spawn }
            }
            KIND_SET_HOUSE => {
                let id = need(reader.read_u32_le())?;
                let house = if need(reader.read_bool())? {
                    Some(read_house_props(&mut reader)?)
                } else {
                    None
                };
                Change::SetHouse { id, house }
            }
            KIND_SET_TOWN => {
                let id = need(reader.read_u32_le())?;
                let town = if need(reader.read_bool())? {
                    Some(read_town_props(&mut reader)?)
                } else {
                    None
                };
                Change::SetTown { id, town }
            }
            KIND_SET_WAYPOINT => {
                let name = need(reader.read_string_lossy())?;
                let has_position = need(reader.read_bool())?;
                let position = need(reader.read_position())?;
                Change::SetWaypoint {
                    name,
                    position: has_position.then_some(position),
                }
            }
            other => return Err(CodecError::corrupt(format!("unknown change kind {}", other))),
        };
        Ok(PendingChange {
            change,
            filled: false,
        })
    }

    /// Anchor for tile offsets of a child tile node.
    pub(crate) fn position(&self) -> Position {
        self.change.position().unwrap_or_default()
    }

    /// Node type of the child this change still accepts, if any.
    pub(crate) fn accepts(&self) -> Option<u8> {
        if self.filled {
            return None;
        }
        match self.change {
            Change::ReplaceTile { .. } => Some(NODE_TILE),
            Change::SetGround { .. } => Some(NODE_GROUND),
            Change::AddItem { .. } => Some(NODE_ITEM),
            _ => None,
        }
    }

    pub(crate) fn attach_tile(&mut self, tile: Tile) -> Result<(), CodecError> {
        match &mut self.change {
            Change::ReplaceTile { position, tile: slot } if !self.filled => {
                if tile.position != *position {
                    return Err(CodecError::corrupt(format!(
                        "tile {} attached to change at {}",
                        tile.position, position
                    )));
                }
                *slot = Some(tile);
            }
            _ => return Err(CodecError::corrupt("unexpected tile in change")),
        }
        self.filled = true;
        Ok(())
    }

    pub(crate) fn attach_ground(&mut self, item: Item) -> Result<(), CodecError> {
        match &mut self.change {
            Change::SetGround { ground, .. } if !self.filled => *ground = Some(item),
            _ => return Err(CodecError::corrupt("unexpected ground in change")),
        }
        self.filled = true;
        Ok(())
    }

    pub(crate) fn attach_item(&mut self, item: Item) -> Result<(), CodecError> {
        match &mut self.change {
            Change::AddItem { item: slot, .. } if !self.filled => *slot = item,
            _ => return Err(CodecError::corrupt("unexpected item in change")),
        }
        self.filled = true;
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Change, CodecError> {
        if matches!(self.change, Change::AddItem { .. }) && !self.filled {
            return Err(CodecError::corrupt("item change without an item"));
        }
        Ok(self.change)
    }
}
