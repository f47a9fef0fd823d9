use crate::codec::attributes::{
    read_item_props, read_map_data_attrs, read_tile_attrs, write_item_props,
    write_map_data_attrs, write_tile_attrs, Framing,
};
use crate::codec::batch::PendingChange;
use crate::codec::node::*;
use crate::codec::{need, CURRENT_VERSION, MIN_VERSION};
use crate::edit::change::{BatchId, Change, ChangeBatch};
use crate::entities::creature::Creature;
use crate::entities::item::{Item, MAX_CONTAINER_DEPTH};
use crate::error::CodecError;
use crate::net::packet::{PacketReader, PacketWriter};
use crate::world::housing::{House, Town};
use crate::world::map::MapStore;
use crate::world::position::{Direction, Position, MAX_FLOOR};
use crate::world::region::Region;
use crate::world::spawns::Spawn;
use crate::world::tile::Tile;
use crate::world::waypoints::Waypoint;
use std::collections::BTreeSet;
use std::io::{BufReader, BufWriter, Read, Write};

/// Side of the square tile blocks grouped under one `TILE_AREA` node.
pub const AREA_SIZE: u16 = 256;

/// Deepest node nesting the decoder accepts: root, map data, area and tile
/// above an item chain of `MAX_CONTAINER_DEPTH + 1` nodes.
pub const MAX_DEPTH: usize = MAX_CONTAINER_DEPTH + 5;

const NO_PARENT: u8 = 0xff;

pub fn encode<W: Write>(store: &MapStore, writer: W) -> Result<(), CodecError> {
    let mut nodes = NodeWriter::new(BufWriter::new(writer));
    let mut props = PacketWriter::new();
    let metadata = store.metadata();

    nodes.write_identifier()?;
    nodes.start_node(NODE_ROOT)?;
    props.write_u32_le(CURRENT_VERSION);
    props.write_u16_le(metadata.width);
    props.write_u16_le(metadata.height);
    props.write_u32_le(metadata.items_major);
    props.write_u32_le(metadata.items_minor);
    nodes.write_props(props.as_slice())?;

    nodes.start_node(NODE_MAP_DATA)?;
    props.clear();
    write_map_data_attrs(&mut props, metadata);
    nodes.write_props(props.as_slice())?;

    write_tile_areas(&mut nodes, store, None)?;

    nodes.start_node(NODE_TOWNS)?;
    for town in store.towns().values() {
        nodes.start_node(NODE_TOWN)?;
        props.clear();
        write_town_props(&mut props, town);
        nodes.write_props(props.as_slice())?;
        nodes.end_node()?;
    }
    nodes.end_node()?;

    nodes.start_node(NODE_HOUSES)?;
    for house in store.houses().values() {
        nodes.start_node(NODE_HOUSE)?;
        props.clear();
        write_house_props(&mut props, house);
        nodes.write_props(props.as_slice())?;
        nodes.end_node()?;
    }
    nodes.end_node()?;

    nodes.start_node(NODE_WAYPOINTS)?;
    for waypoint in store.waypoints().iter() {
        nodes.start_node(NODE_WAYPOINT)?;
        props.clear();
        props.write_string_str(&waypoint.name);
        props.write_position(waypoint.position);
        nodes.write_props(props.as_slice())?;
        nodes.end_node()?;
    }
    nodes.end_node()?;

    nodes.start_node(NODE_SPAWNS)?;
    for spawn in store.spawns().values() {
        nodes.start_node(NODE_SPAWN_AREA)?;
        props.clear();
        write_spawn_props(&mut props, spawn);
        nodes.write_props(props.as_slice())?;
        nodes.end_node()?;
    }
    nodes.end_node()?;

    nodes.end_node()?;
    nodes.end_node()?;
    nodes.finish()?;
    Ok(())
}

pub fn encode_to_vec(store: &MapStore) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode(store, &mut out)?;
    Ok(out)
}

/// Streams a map file into a fresh store. Nothing is returned unless the
/// whole stream parses.
pub fn decode<R: Read>(reader: R) -> Result<MapStore, CodecError> {
    let mut nodes = NodeReader::open(BufReader::new(reader))?;
    let mut decoder = TreeDecoder::new(NODE_ROOT);
    decoder.run(&mut nodes)?;
    Ok(decoder.store)
}

pub fn decode_slice(bytes: &[u8]) -> Result<MapStore, CodecError> {
    decode(bytes)
}

/// Encodes every tile of `region` as a bare `MAP_DATA` tree, for region resyncs.
pub fn encode_tiles(store: &MapStore, region: Region) -> Result<Vec<u8>, CodecError> {
    let mut nodes = NodeWriter::new(Vec::new());
    nodes.start_node(NODE_MAP_DATA)?;
    write_tile_areas(&mut nodes, store, Some(region))?;
    nodes.end_node()?;
    nodes.finish()
}

pub fn decode_tiles(bytes: &[u8]) -> Result<Vec<Tile>, CodecError> {
    let mut nodes = NodeReader::new(bytes);
    let mut decoder = TreeDecoder::new(NODE_MAP_DATA);
    decoder.run(&mut nodes)?;
    Ok(decoder.store.iter(None).cloned().collect())
}

fn area_base(position: Position) -> Position {
    Position::new(
        position.x & !(AREA_SIZE - 1),
        position.y & !(AREA_SIZE - 1),
        position.z,
    )
}

/// Writes tiles grouped by area, each area in (y, x) order, areas in (z, y, x) order.
fn write_tile_areas<W: Write>(
    nodes: &mut NodeWriter<W>,
    store: &MapStore,
    region: Option<Region>,
) -> Result<(), CodecError> {
    let areas: BTreeSet<Position> = store
        .iter(region)
        .map(|tile| area_base(tile.position))
        .collect();
    let mut props = PacketWriter::new();
    for base in areas {
        let span = Region::new(
            base,
            Position::new(base.x | (AREA_SIZE - 1), base.y | (AREA_SIZE - 1), base.z),
        );
        nodes.start_node(NODE_TILE_AREA)?;
        props.clear();
        props.write_position(base);
        nodes.write_props(props.as_slice())?;
        for tile in store.iter(Some(span)) {
            if region.map_or(true, |region| region.contains(tile.position)) {
                write_tile(nodes, tile, &mut props)?;
            }
        }
        nodes.end_node()?;
    }
    Ok(())
}

pub(crate) fn write_tile<W: Write>(
    nodes: &mut NodeWriter<W>,
    tile: &Tile,
    props: &mut PacketWriter,
) -> Result<(), CodecError> {
    let node_type = if tile.house_id.is_some() {
        NODE_HOUSETILE
    } else {
        NODE_TILE
    };
    nodes.start_node(node_type)?;
    props.clear();
    props.write_u8((tile.position.x & 0xff) as u8);
    props.write_u8((tile.position.y & 0xff) as u8);
    if let Some(house_id) = tile.house_id {
        props.write_u32_le(house_id);
    }
    write_tile_attrs(props, tile);
    nodes.write_props(props.as_slice())?;

    if let Some(ground) = tile.ground.as_ref().filter(|ground| !ground.is_plain()) {
        write_item_tree(nodes, NODE_GROUND, ground)?;
    }
    for item in &tile.items {
        write_item_tree(nodes, NODE_ITEM, item)?;
    }
    if let Some(creature) = &tile.creature {
        nodes.start_node(NODE_CREATURE)?;
        props.clear();
        write_creature_props(props, creature);
        nodes.write_props(props.as_slice())?;
        nodes.end_node()?;
    }
    nodes.end_node()
}

/// Writes an item and its container contents depth-first without recursion.
pub(crate) fn write_item_tree<W: Write>(
    nodes: &mut NodeWriter<W>,
    node_type: u8,
    item: &Item,
) -> Result<(), CodecError> {
    let depth = item.nesting_depth();
    if depth > MAX_CONTAINER_DEPTH {
        return Err(CodecError::NestingTooDeep {
            depth,
            limit: MAX_CONTAINER_DEPTH,
        });
    }
    let mut props = PacketWriter::new();
    nodes.start_node(node_type)?;
    write_item_props(&mut props, item)?;
    nodes.write_props(props.as_slice())?;

    let mut stack = vec![item.contents.iter()];
    while let Some(siblings) = stack.last_mut() {
        match siblings.next() {
            Some(child) => {
                nodes.start_node(NODE_ITEM)?;
                props.clear();
                write_item_props(&mut props, child)?;
                nodes.write_props(props.as_slice())?;
                stack.push(child.contents.iter());
            }
            None => {
                stack.pop();
                nodes.end_node()?;
            }
        }
    }
    Ok(())
}

pub(crate) fn write_creature_props(props: &mut PacketWriter, creature: &Creature) {
    props.write_string_str(&creature.name);
    props.write_u32_le(creature.spawn_interval);
    props.write_u8(creature.direction.to_byte());
}

pub(crate) fn read_creature_props(reader: &mut PacketReader<'_>) -> Result<Creature, CodecError> {
    let name = need(reader.read_string_lossy())?;
    let spawn_interval = need(reader.read_u32_le())?;
    let direction = need(reader.read_u8())?;
    let direction = Direction::from_byte(direction)
        .ok_or_else(|| CodecError::corrupt(format!("invalid creature direction {}", direction)))?;
    Ok(Creature {
        name,
        spawn_interval,
        direction,
    })
}

pub(crate) fn write_house_props(props: &mut PacketWriter, house: &House) {
    props.write_u32_le(house.id);
    props.write_string_str(&house.name);
    props.write_u32_le(house.town_id);
    props.write_u32_le(house.rent);
    props.write_bool(house.guildhall);
    props.write_bool(house.exit.is_some());
    if let Some(exit) = house.exit {
        props.write_position(exit);
    }
}

pub(crate) fn read_house_props(reader: &mut PacketReader<'_>) -> Result<House, CodecError> {
    let id = need(reader.read_u32_le())?;
    let name = need(reader.read_string_lossy())?;
    let town_id = need(reader.read_u32_le())?;
    let rent = need(reader.read_u32_le())?;
    let guildhall = need(reader.read_bool())?;
    let exit = if need(reader.read_bool())? {
        Some(need(reader.read_position())?)
    } else {
        None
    };
    Ok(House {
        id,
        name,
        town_id,
        rent,
        exit,
        guildhall,
    })
}

pub(crate) fn write_town_props(props: &mut PacketWriter, town: &Town) {
    props.write_u32_le(town.id);
    props.write_string_str(&town.name);
    props.write_position(town.temple);
}

pub(crate) fn read_town_props(reader: &mut PacketReader<'_>) -> Result<Town, CodecError> {
    let id = need(reader.read_u32_le())?;
    let name = need(reader.read_string_lossy())?;
    let temple = need(reader.read_position())?;
    Ok(Town { id, name, temple })
}

pub(crate) fn write_spawn_props(props: &mut PacketWriter, spawn: &Spawn) {
    props.write_position(spawn.center);
    props.write_u16_le(spawn.radius);
}

pub(crate) fn read_spawn_props(reader: &mut PacketReader<'_>) -> Result<Spawn, CodecError> {
    let center = need(reader.read_position())?;
    let radius = need(reader.read_u16_le())?;
    Ok(Spawn::new(center, radius))
}

fn read_area(props: &[u8]) -> Result<Position, CodecError> {
    let base = need(PacketReader::new(props).read_position())?;
    if base.z > MAX_FLOOR {
        return Err(CodecError::corrupt(format!("tile area on floor {}", base.z)));
    }
    Ok(base)
}

fn read_tile(
    base: Position,
    node_type: u8,
    props: &[u8],
    framing: Framing,
) -> Result<Tile, CodecError> {
    let mut reader = PacketReader::new(props);
    let dx = need(reader.read_u8())?;
    let dy = need(reader.read_u8())?;
    let x = base.x.checked_add(u16::from(dx));
    let y = base.y.checked_add(u16::from(dy));
    let (Some(x), Some(y)) = (x, y) else {
        return Err(CodecError::corrupt("tile offset overflows map space"));
    };
    let mut tile = Tile::new(Position::new(x, y, base.z));
    if node_type == NODE_HOUSETILE {
        tile.house_id = Some(need(reader.read_u32_le())?);
    }
    read_tile_attrs(&mut reader, framing, &mut tile)?;
    Ok(tile)
}

enum Frame {
    Root,
    MapData,
    TileArea(Position),
    Tile(Tile),
    Item(Item),
    Ground(Item),
    Group(u8),
    Leaf(u8),
    Batch,
    Change(PendingChange),
}

impl Frame {
    fn node_type(&self) -> u8 {
        match self {
            Frame::Root => NODE_ROOT,
            Frame::MapData => NODE_MAP_DATA,
            Frame::TileArea(_) => NODE_TILE_AREA,
            Frame::Tile(tile) if tile.house_id.is_some() => NODE_HOUSETILE,
            Frame::Tile(_) => NODE_TILE,
            Frame::Item(_) => NODE_ITEM,
            Frame::Ground(_) => NODE_GROUND,
            Frame::Group(node_type) | Frame::Leaf(node_type) => *node_type,
            Frame::Batch => NODE_BATCH,
            Frame::Change(_) => NODE_CHANGE,
        }
    }
}

/// What the innermost open node allows as a child, copied out of the stack
/// so the decoder can mutate itself while deciding.
#[derive(Clone, Copy)]
enum Parent {
    Top,
    Root,
    MapData,
    TileArea(Position),
    Tile,
    Container,
    Group(u8),
    Batch,
    Change { base: Position, accepts: Option<u8> },
    Closed(u8),
}

/// Explicit-stack decoder shared by map files, region snapshots and batches.
pub(crate) struct TreeDecoder {
    top: u8,
    stack: Vec<Frame>,
    framing: Framing,
    finished: bool,
    pub(crate) store: MapStore,
    pub(crate) batch_id: Option<BatchId>,
    pub(crate) changes: Vec<Change>,
}

impl TreeDecoder {
    pub(crate) fn new(top: u8) -> Self {
        TreeDecoder {
            top,
            stack: Vec::new(),
            framing: Framing::for_version(CURRENT_VERSION),
            finished: false,
            store: MapStore::default(),
            batch_id: None,
            changes: Vec::new(),
        }
    }

    pub(crate) fn run<R: Read>(&mut self, nodes: &mut NodeReader<R>) -> Result<(), CodecError> {
        while let Some(event) = nodes.next_event()? {
            match event {
                NodeEvent::Enter { node_type, props } => self.enter(node_type, &props)?,
                NodeEvent::Leave => self.leave()?,
            }
        }
        if !self.finished {
            return Err(CodecError::Truncated);
        }
        Ok(())
    }

    pub(crate) fn into_batch(self) -> Result<ChangeBatch, CodecError> {
        let id = self
            .batch_id
            .ok_or_else(|| CodecError::corrupt("batch without header"))?;
        Ok(ChangeBatch::with_id(id, self.changes))
    }

    fn parent(&self) -> Parent {
        match self.stack.last() {
            None => Parent::Top,
            Some(Frame::Root) => Parent::Root,
            Some(Frame::MapData) => Parent::MapData,
            Some(Frame::TileArea(base)) => Parent::TileArea(*base),
            Some(Frame::Tile(_)) => Parent::Tile,
            Some(Frame::Item(_)) | Some(Frame::Ground(_)) => Parent::Container,
            Some(Frame::Group(node_type)) => Parent::Group(*node_type),
            Some(Frame::Batch) => Parent::Batch,
            Some(Frame::Change(change)) => Parent::Change {
                base: area_base(change.position()),
                accepts: change.accepts(),
            },
            Some(frame @ Frame::Leaf(_)) => Parent::Closed(frame.node_type()),
        }
    }

    fn enter(&mut self, node_type: u8, props: &[u8]) -> Result<(), CodecError> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(CodecError::corrupt("node nesting too deep"));
        }
        let unknown = |parent: u8| CodecError::UnknownNodeType { node_type, parent };
        let framing = self.framing;

        let frame = match (self.parent(), node_type) {
            (Parent::Top, _) if self.finished || node_type != self.top => {
                return Err(unknown(NO_PARENT))
            }
            (Parent::Top, NODE_ROOT) => {
                self.read_root(props)?;
                Frame::Root
            }
            (Parent::Top, NODE_BATCH) => {
                self.batch_id = Some(BatchId(need(PacketReader::new(props).read_u64_le())?));
                Frame::Batch
            }
            (Parent::Top, NODE_MAP_DATA) | (Parent::Root, NODE_MAP_DATA) => {
                read_map_data_attrs(props, framing, self.store.metadata_mut())?;
                Frame::MapData
            }
            (Parent::MapData, NODE_TILE_AREA) => Frame::TileArea(read_area(props)?),
            (Parent::MapData, NODE_TOWNS | NODE_HOUSES | NODE_WAYPOINTS | NODE_SPAWNS) => {
                Frame::Group(node_type)
            }
            (Parent::TileArea(base), NODE_TILE | NODE_HOUSETILE) => {
                Frame::Tile(read_tile(base, node_type, props, framing)?)
            }
            (Parent::Change { base, accepts }, NODE_TILE | NODE_HOUSETILE)
                if accepts == Some(NODE_TILE) =>
            {
                Frame::Tile(read_tile(base, node_type, props, framing)?)
            }
            (Parent::Tile | Parent::Container, NODE_ITEM) => {
                Frame::Item(read_item_props(props, framing)?)
            }
            (Parent::Change { accepts, .. }, NODE_ITEM) if accepts == Some(NODE_ITEM) => {
                Frame::Item(read_item_props(props, framing)?)
            }
            (Parent::Tile, NODE_GROUND) => Frame::Ground(read_item_props(props, framing)?),
            (Parent::Change { accepts, .. }, NODE_GROUND) if accepts == Some(NODE_GROUND) => {
                Frame::Ground(read_item_props(props, framing)?)
            }
            (Parent::Tile, NODE_CREATURE) => {
                let creature = read_creature_props(&mut PacketReader::new(props))?;
                if let Some(Frame::Tile(tile)) = self.stack.last_mut() {
                    tile.creature = Some(creature);
                }
                Frame::Leaf(node_type)
            }
            (Parent::Group(NODE_TOWNS), NODE_TOWN) => {
                let town = read_town_props(&mut PacketReader::new(props))?;
                self.store.put_town(town.id, Some(town));
                Frame::Leaf(node_type)
            }
            (Parent::Group(NODE_HOUSES), NODE_HOUSE) => {
                let house = read_house_props(&mut PacketReader::new(props))?;
                self.store.put_house(house.id, Some(house));
                Frame::Leaf(node_type)
            }
            (Parent::Group(NODE_WAYPOINTS), NODE_WAYPOINT) => {
                let mut reader = PacketReader::new(props);
                let name = need(reader.read_string_lossy())?;
                let position = need(reader.read_position())?;
                self.store
                    .put_waypoint(&name.clone(), Some(Waypoint { name, position }));
                Frame::Leaf(node_type)
            }
            (Parent::Group(NODE_SPAWNS), NODE_SPAWN_AREA) => {
                let spawn = read_spawn_props(&mut PacketReader::new(props))?;
                self.store.put_spawn(spawn.center, Some(spawn));
                Frame::Leaf(node_type)
            }
            (Parent::Batch, NODE_CHANGE) => Frame::Change(PendingChange::read(props)?),
            (parent, _) => {
                let parent_type = match parent {
                    Parent::Top => NO_PARENT,
                    Parent::Root => NODE_ROOT,
                    Parent::MapData => NODE_MAP_DATA,
                    Parent::TileArea(_) => NODE_TILE_AREA,
                    Parent::Tile => NODE_TILE,
                    Parent::Container => NODE_ITEM,
                    Parent::Group(node_type) | Parent::Closed(node_type) => node_type,
                    Parent::Batch => NODE_BATCH,
                    Parent::Change { .. } => NODE_CHANGE,
                };
                return Err(unknown(parent_type));
            }
        };
        self.stack.push(frame);
        Ok(())
    }

    fn read_root(&mut self, props: &[u8]) -> Result<(), CodecError> {
        let mut reader = PacketReader::new(props);
        let version = need(reader.read_u32_le())?;
        if !(MIN_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(CodecError::VersionUnsupported(version));
        }
        self.framing = Framing::for_version(version);
        let metadata = self.store.metadata_mut();
        metadata.version = version;
        metadata.width = need(reader.read_u16_le())?;
        metadata.height = need(reader.read_u16_le())?;
        metadata.items_major = need(reader.read_u32_le())?;
        metadata.items_minor = need(reader.read_u32_le())?;
        if version < CURRENT_VERSION {
            log::info!("reading legacy map format version {}", version);
        }
        Ok(())
    }

    fn leave(&mut self) -> Result<(), CodecError> {
        let frame = self
            .stack
            .pop()
            .ok_or_else(|| CodecError::corrupt("unbalanced node end"))?;
        match frame {
            Frame::Item(item) => match self.stack.last_mut() {
                Some(Frame::Tile(tile)) => tile.items.push(item),
                Some(Frame::Item(parent)) | Some(Frame::Ground(parent)) => {
                    parent.contents.push(item)
                }
                Some(Frame::Change(change)) => change.attach_item(item)?,
                _ => return Err(CodecError::corrupt("item outside a tile")),
            },
            Frame::Ground(item) => match self.stack.last_mut() {
                Some(Frame::Tile(tile)) => tile.ground = Some(item),
                Some(Frame::Change(change)) => change.attach_ground(item)?,
                _ => return Err(CodecError::corrupt("ground outside a tile")),
            },
            Frame::Tile(tile) => match self.stack.last_mut() {
                Some(Frame::TileArea(_)) => {
                    self.store
                        .put_tile(tile)
                        .map_err(|err| CodecError::corrupt(err.to_string()))?;
                }
                Some(Frame::Change(change)) => change.attach_tile(tile)?,
                _ => return Err(CodecError::corrupt("tile outside a tile area")),
            },
            Frame::Change(change) => self.changes.push(change.finish()?),
            Frame::Root | Frame::Batch | Frame::MapData if self.stack.is_empty() => {
                self.finished = true;
            }
            Frame::Root
            | Frame::Batch
            | Frame::MapData
            | Frame::TileArea(_)
            | Frame::Group(_)
            | Frame::Leaf(_) => {}
        }
        Ok(())
    }
}
