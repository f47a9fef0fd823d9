use crate::error::CodecError;
use std::io::{self, Read, Write};

pub const NODE_START: u8 = 0xfe;
pub const NODE_END: u8 = 0xff;
pub const ESCAPE: u8 = 0xfd;

pub const NODE_ROOT: u8 = 0x00;
pub const NODE_MAP_DATA: u8 = 0x02;
pub const NODE_TILE_AREA: u8 = 0x04;
pub const NODE_TILE: u8 = 0x05;
pub const NODE_ITEM: u8 = 0x06;
pub const NODE_SPAWNS: u8 = 0x09;
pub const NODE_SPAWN_AREA: u8 = 0x0a;
pub const NODE_TOWNS: u8 = 0x0c;
pub const NODE_TOWN: u8 = 0x0d;
pub const NODE_HOUSETILE: u8 = 0x0e;
pub const NODE_WAYPOINTS: u8 = 0x0f;
pub const NODE_WAYPOINT: u8 = 0x10;
pub const NODE_HOUSES: u8 = 0x11;
pub const NODE_HOUSE: u8 = 0x12;
pub const NODE_CREATURE: u8 = 0x13;
pub const NODE_GROUND: u8 = 0x14;
pub const NODE_BATCH: u8 = 0x40;
pub const NODE_CHANGE: u8 = 0x41;

/// Largest unescaped property block accepted for a single node.
pub const MAX_PROPS_LEN: usize = 16 * 1024 * 1024;

pub const IDENTIFIER: [u8; 4] = *b"OTBM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Enter { node_type: u8, props: Vec<u8> },
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Start,
    End,
}

/// Pull parser over a node stream. Never recurses; depth is a counter.
pub struct NodeReader<R: Read> {
    input: R,
    pending: Option<Marker>,
    depth: usize,
    started: bool,
    consumed: u64,
}

impl<R: Read> NodeReader<R> {
    /// Reader for a bare node tree with no file identifier.
    pub fn new(input: R) -> Self {
        NodeReader {
            input,
            pending: None,
            depth: 0,
            started: false,
            consumed: 0,
        }
    }

    /// Reader for a map file: checks the 4-byte identifier first.
    pub fn open(input: R) -> Result<Self, CodecError> {
        let mut reader = Self::new(input);
        let mut identifier = [0u8; 4];
        for slot in identifier.iter_mut() {
            *slot = reader.next_byte()?;
        }
        if identifier != IDENTIFIER && identifier != [0u8; 4] {
            return Err(CodecError::corrupt(format!(
                "unrecognized file identifier {:02x?}",
                identifier
            )));
        }
        Ok(reader)
    }

    /// Next structural event, or `None` once the outermost node has closed.
    pub fn next_event(&mut self) -> Result<Option<NodeEvent>, CodecError> {
        let marker = match self.pending.take() {
            Some(marker) => marker,
            None => {
                if self.started && self.depth == 0 {
                    return Ok(None);
                }
                match self.next_byte()? {
                    NODE_START => Marker::Start,
                    NODE_END => Marker::End,
                    other => {
                        return Err(CodecError::corrupt(format!(
                            "expected node marker at offset {}, found 0x{:02x}",
                            self.consumed - 1,
                            other
                        )))
                    }
                }
            }
        };

        match marker {
            Marker::Start => {
                let node_type = self.next_unescaped()?;
                let mut props = Vec::new();
                loop {
                    match self.next_byte()? {
                        ESCAPE => props.push(self.next_byte()?),
                        NODE_START => {
                            self.pending = Some(Marker::Start);
                            break;
                        }
                        NODE_END => {
                            self.pending = Some(Marker::End);
                            break;
                        }
                        byte => props.push(byte),
                    }
                    if props.len() > MAX_PROPS_LEN {
                        return Err(CodecError::corrupt("node properties exceed size limit"));
                    }
                }
                self.depth += 1;
                self.started = true;
                Ok(Some(NodeEvent::Enter { node_type, props }))
            }
            Marker::End => {
                if self.depth == 0 {
                    return Err(CodecError::corrupt("node end without matching start"));
                }
                self.depth -= 1;
                Ok(Some(NodeEvent::Leave))
            }
        }
    }

    fn next_unescaped(&mut self) -> Result<u8, CodecError> {
        match self.next_byte()? {
            ESCAPE => self.next_byte(),
            NODE_START | NODE_END => Err(CodecError::corrupt("node without a type byte")),
            byte => Ok(byte),
        }
    }

    fn next_byte(&mut self) -> Result<u8, CodecError> {
        let mut byte = [0u8; 1];
        match self.input.read_exact(&mut byte) {
            Ok(()) => {
                self.consumed += 1;
                Ok(byte[0])
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::Truncated),
            Err(err) => Err(CodecError::Io(err)),
        }
    }
}

/// Writes a node tree, escaping every payload byte that collides with a marker.
pub struct NodeWriter<W: Write> {
    output: W,
    depth: usize,
    scratch: Vec<u8>,
}

impl<W: Write> NodeWriter<W> {
    pub fn new(output: W) -> Self {
        NodeWriter {
            output,
            depth: 0,
            scratch: Vec::new(),
        }
    }

    pub fn write_identifier(&mut self) -> Result<(), CodecError> {
        self.output.write_all(&IDENTIFIER)?;
        Ok(())
    }

    pub fn start_node(&mut self, node_type: u8) -> Result<(), CodecError> {
        self.output.write_all(&[NODE_START])?;
        self.depth += 1;
        self.write_props(&[node_type])
    }

    pub fn write_props(&mut self, props: &[u8]) -> Result<(), CodecError> {
        self.scratch.clear();
        self.scratch.reserve(props.len());
        for &byte in props {
            if matches!(byte, NODE_START | NODE_END | ESCAPE) {
                self.scratch.push(ESCAPE);
            }
            self.scratch.push(byte);
        }
        self.output.write_all(&self.scratch)?;
        Ok(())
    }

    pub fn end_node(&mut self) -> Result<(), CodecError> {
        if self.depth == 0 {
            return Err(CodecError::corrupt("end_node without open node"));
        }
        self.output.write_all(&[NODE_END])?;
        self.depth -= 1;
        Ok(())
    }

    /// Flushes and hands back the sink; fails if a node was left open.
    pub fn finish(mut self) -> Result<W, CodecError> {
        if self.depth != 0 {
            return Err(CodecError::corrupt(format!(
                "{} node(s) left open",
                self.depth
            )));
        }
        self.output.flush()?;
        Ok(self.output)
    }
}
