//! Session messages. Every frame body starts with an opcode byte.

use crate::codec::{self, need};
use crate::edit::change::{BatchId, ChangeBatch};
use crate::error::{CodecError, ConflictError};
use crate::net::packet::{PacketReader, PacketWriter};
use crate::world::region::Region;
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use sha1::{Digest, Sha1};

pub const PROTOCOL_VERSION: u32 = 5;

pub const OP_HELLO: u8 = 0x01;
pub const OP_FULL_SNAPSHOT: u8 = 0x02;
pub const OP_CHANGE_BATCH: u8 = 0x03;
pub const OP_ACK: u8 = 0x04;
pub const OP_REJECT: u8 = 0x05;
pub const OP_PING: u8 = 0x06;
pub const OP_PONG: u8 = 0x07;
pub const OP_GOODBYE: u8 = 0x08;
pub const OP_RESYNC_REQUEST: u8 = 0x09;
pub const OP_REGION_SNAPSHOT: u8 = 0x0a;

const CONFLICT_LOCKED: u8 = 1;
const CONFLICT_STALE: u8 = 2;
const CONFLICT_OUT_OF_BOUNDS: u8 = 3;

pub type Digest20 = [u8; 20];

pub fn snapshot_digest(bytes: &[u8]) -> Digest20 {
    let mut sha1 = Sha1::new();
    sha1.update(bytes);
    sha1.finalize().into()
}

/// Printable form of a digest for logs and `mapedit info`.
pub fn digest_text(digest: &Digest20) -> String {
    BASE64_ENGINE.encode(digest)
}

/// A replicated batch with its ordering metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMessage {
    /// Per-connection, per-direction counter starting at 1.
    pub seq: u64,
    /// Session that authored the batch; 0 is the host itself.
    pub originator: u32,
    /// Store revision the sender had applied when it built the batch.
    pub base_revision: u64,
    /// Host revision after applying the batch (0 on client submissions).
    pub revision: u64,
    pub batch: ChangeBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        protocol_version: u32,
        name: String,
    },
    FullSnapshot {
        session_id: u32,
        revision: u64,
        digest: Digest20,
        encoded_map: Vec<u8>,
    },
    ChangeBatch(BatchMessage),
    Ack {
        batch_id: BatchId,
        revision: u64,
    },
    Reject {
        batch_id: BatchId,
        reason: ConflictError,
        region: Option<Region>,
    },
    Ping,
    Pong,
    Goodbye {
        reason: String,
    },
    ResyncRequest {
        region: Region,
    },
    RegionSnapshot {
        revision: u64,
        region: Region,
        tiles: Vec<u8>,
    },
}

impl Message {
    pub fn opcode(&self) -> u8 {
        match self {
            Message::Hello { .. } => OP_HELLO,
            Message::FullSnapshot { .. } => OP_FULL_SNAPSHOT,
            Message::ChangeBatch(_) => OP_CHANGE_BATCH,
            Message::Ack { .. } => OP_ACK,
            Message::Reject { .. } => OP_REJECT,
            Message::Ping => OP_PING,
            Message::Pong => OP_PONG,
            Message::Goodbye { .. } => OP_GOODBYE,
            Message::ResyncRequest { .. } => OP_RESYNC_REQUEST,
            Message::RegionSnapshot { .. } => OP_REGION_SNAPSHOT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::FullSnapshot { .. } => "full-snapshot",
            Message::ChangeBatch(_) => "change-batch",
            Message::Ack { .. } => "ack",
            Message::Reject { .. } => "reject",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Goodbye { .. } => "goodbye",
            Message::ResyncRequest { .. } => "resync-request",
            Message::RegionSnapshot { .. } => "region-snapshot",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut writer = PacketWriter::new();
        writer.write_u8(self.opcode());
        match self {
            Message::Hello {
                protocol_version,
                name,
            } => {
                writer.write_u32_le(*protocol_version);
                writer.write_string_str(name);
            }
            Message::FullSnapshot {
                session_id,
                revision,
                digest,
                encoded_map,
            } => {
                writer.write_u32_le(*session_id);
                writer.write_u64_le(*revision);
                writer.write_bytes(digest);
                writer.write_blob(encoded_map);
            }
            Message::ChangeBatch(message) => {
                writer.write_u64_le(message.seq);
                writer.write_u64_le(message.batch.id.0);
                writer.write_u32_le(message.originator);
                writer.write_u64_le(message.base_revision);
                writer.write_u64_le(message.revision);
                writer.write_blob(&codec::encode_batch(&message.batch)?);
            }
            Message::Ack { batch_id, revision } => {
                writer.write_u64_le(batch_id.0);
                writer.write_u64_le(*revision);
            }
            Message::Reject {
                batch_id,
                reason,
                region,
            } => {
                writer.write_u64_le(batch_id.0);
                write_conflict(&mut writer, reason);
                writer.write_bool(region.is_some());
                if let Some(region) = region {
                    write_region(&mut writer, *region);
                }
            }
            Message::Ping | Message::Pong => {}
            Message::Goodbye { reason } => writer.write_string_str(reason),
            Message::ResyncRequest { region } => write_region(&mut writer, *region),
            Message::RegionSnapshot {
                revision,
                region,
                tiles,
            } => {
                writer.write_u64_le(*revision);
                write_region(&mut writer, *region);
                writer.write_blob(tiles);
            }
        }
        Ok(writer.into_vec())
    }

    pub fn decode(body: &[u8]) -> Result<Message, CodecError> {
        let mut reader = PacketReader::new(body);
        let opcode = need(reader.read_u8())?;
        let message = match opcode {
            OP_HELLO => Message::Hello {
                protocol_version: need(reader.read_u32_le())?,
                name: need(reader.read_string_lossy())?,
            },
            OP_FULL_SNAPSHOT => {
                let session_id = need(reader.read_u32_le())?;
                let revision = need(reader.read_u64_le())?;
                let mut digest = [0u8; 20];
                digest.copy_from_slice(need(reader.read_bytes(20))?);
                Message::FullSnapshot {
                    session_id,
                    revision,
                    digest,
                    encoded_map: need(reader.read_blob())?.to_vec(),
                }
            }
            OP_CHANGE_BATCH => {
                let seq = need(reader.read_u64_le())?;
                let batch_id = BatchId(need(reader.read_u64_le())?);
                let originator = need(reader.read_u32_le())?;
                let base_revision = need(reader.read_u64_le())?;
                let revision = need(reader.read_u64_le())?;
                let batch = codec::decode_batch(need(reader.read_blob())?)?;
                if batch.id != batch_id {
                    return Err(CodecError::corrupt(format!(
                        "batch header id {} does not match body id {}",
                        batch_id.0, batch.id.0
                    )));
                }
                Message::ChangeBatch(BatchMessage {
                    seq,
                    originator,
                    base_revision,
                    revision,
                    batch,
                })
            }
            OP_ACK => Message::Ack {
                batch_id: BatchId(need(reader.read_u64_le())?),
                revision: need(reader.read_u64_le())?,
            },
            OP_REJECT => {
                let batch_id = BatchId(need(reader.read_u64_le())?);
                let reason = read_conflict(&mut reader)?;
                let region = if need(reader.read_bool())? {
                    Some(read_region(&mut reader)?)
                } else {
                    None
                };
                Message::Reject {
                    batch_id,
                    reason,
                    region,
                }
            }
            OP_PING => Message::Ping,
            OP_PONG => Message::Pong,
            OP_GOODBYE => Message::Goodbye {
                reason: need(reader.read_string_lossy())?,
            },
            OP_RESYNC_REQUEST => Message::ResyncRequest {
                region: read_region(&mut reader)?,
            },
            OP_REGION_SNAPSHOT => Message::RegionSnapshot {
                revision: need(reader.read_u64_le())?,
                region: read_region(&mut reader)?,
                tiles: need(reader.read_blob())?.to_vec(),
            },
            other => return Err(CodecError::corrupt(format!("unknown opcode 0x{:02x}", other))),
        };
        Ok(message)
    }
}

fn write_region(writer: &mut PacketWriter, region: Region) {
    writer.write_position(region.min);
    writer.write_position(region.max);
}

fn read_region(reader: &mut PacketReader<'_>) -> Result<Region, CodecError> {
    let min = need(reader.read_position())?;
    let max = need(reader.read_position())?;
    Ok(Region::new(min, max))
}

fn write_conflict(writer: &mut PacketWriter, conflict: &ConflictError) {
    match conflict {
        ConflictError::TileLocked { position, holder } => {
            writer.write_u8(CONFLICT_LOCKED);
            writer.write_position(*position);
            writer.write_u32_le(*holder);
        }
        ConflictError::StaleVersion { position, reason } => {
            writer.write_u8(CONFLICT_STALE);
            writer.write_bool(position.is_some());
            writer.write_position(position.unwrap_or_default());
            writer.write_string_str(reason);
        }
        ConflictError::OutOfBounds(position) => {
            writer.write_u8(CONFLICT_OUT_OF_BOUNDS);
            writer.write_position(*position);
        }
    }
}

fn read_conflict(reader: &mut PacketReader<'_>) -> Result<ConflictError, CodecError> {
    Ok(match need(reader.read_u8())? {
        CONFLICT_LOCKED => ConflictError::TileLocked {
            position: need(reader.read_position())?,
            holder: need(reader.read_u32_le())?,
        },
        CONFLICT_STALE => {
            let has_position = need(reader.read_bool())?;
            let position = need(reader.read_position())?;
            ConflictError::StaleVersion {
                position: has_position.then_some(position),
                reason: need(reader.read_string_lossy())?,
            }
        }
        CONFLICT_OUT_OF_BOUNDS => ConflictError::OutOfBounds(need(reader.read_position())?),
        other => return Err(CodecError::corrupt(format!("unknown conflict kind {}", other))),
    })
}
