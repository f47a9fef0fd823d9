use crate::edit::change::{Change, ChangeBatch};
use crate::entities::item::Item;
use crate::world::position::Position;
use std::path::PathBuf;

/// One line typed into the interactive shell of `host` and `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Ground { position: Position, type_id: u16 },
    Add { position: Position, type_id: u16, count: u16 },
    Remove { position: Position, index: u16 },
    Erase { position: Position },
    Waypoint { name: String, position: Option<Position> },
    Undo,
    Redo,
    Save { path: Option<PathBuf> },
    Status,
    Reconnect,
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    /// The map edit this command stands for, if it is one.
    pub fn to_batch(&self) -> Option<ChangeBatch> {
        let change = match self {
            ConsoleCommand::Ground { position, type_id } => Change::SetGround {
                position: *position,
                ground: Some(Item::new(*type_id)),
            },
            ConsoleCommand::Add {
                position,
                type_id,
                count,
            } => Change::AddItem {
                position: *position,
                index: None,
                item: Item::with_count(*type_id, *count),
            },
            ConsoleCommand::Remove { position, index } => Change::RemoveItem {
                position: *position,
                index: *index,
            },
            ConsoleCommand::Erase { position } => Change::ReplaceTile {
                position: *position,
                tile: None,
            },
            ConsoleCommand::Waypoint { name, position } => Change::SetWaypoint {
                name: name.clone(),
                position: *position,
            },
            _ => return None,
        };
        Some(ChangeBatch::single(change))
    }
}

pub fn parse_console_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return Ok(None);
    };
    let command = command.to_ascii_lowercase();
    let parsed = match command.as_str() {
        "ground" | "g" => {
            let position = parse_position(&mut parts)?;
            let type_id = parse_u16(parts.next(), "item type")?;
            ConsoleCommand::Ground { position, type_id }
        }
        "add" | "a" => {
            let position = parse_position(&mut parts)?;
            let type_id = parse_u16(parts.next(), "item type")?;
            let count = match parts.next() {
                Some(value) => parse_u16(Some(value), "count")?,
                None => 1,
            };
            ConsoleCommand::Add {
                position,
                type_id,
                count,
            }
        }
        "remove" | "rm" => {
            let position = parse_position(&mut parts)?;
            let index = parse_u16(parts.next(), "stack index")?;
            ConsoleCommand::Remove { position, index }
        }
        "erase" => ConsoleCommand::Erase {
            position: parse_position(&mut parts)?,
        },
        "waypoint" | "wp" => {
            let name = parts
                .next()
                .ok_or_else(|| "waypoint needs a name".to_string())?
                .to_string();
            let position = if parts.clone().next().is_some() {
                Some(parse_position(&mut parts)?)
            } else {
                None
            };
            ConsoleCommand::Waypoint { name, position }
        }
        "undo" | "u" => ConsoleCommand::Undo,
        "redo" | "r" => ConsoleCommand::Redo,
        "save" => ConsoleCommand::Save {
            path: parts.next().map(PathBuf::from),
        },
        "status" | "st" => ConsoleCommand::Status,
        "reconnect" => ConsoleCommand::Reconnect,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        _ => ConsoleCommand::Unknown(command),
    };
    Ok(Some(parsed))
}

fn parse_position<'a, I>(parts: &mut I) -> Result<Position, String>
where
    I: Iterator<Item = &'a str>,
{
    let x = parse_u16(parts.next(), "x")?;
    let y = parse_u16(parts.next(), "y")?;
    let value = parts
        .next()
        .ok_or_else(|| "command missing z".to_string())?;
    let z = value
        .parse::<u8>()
        .map_err(|_| format!("command expected floor, got '{value}'"))?;
    let position = Position::new(x, y, z);
    if !position.is_valid() {
        return Err(format!("position {position} is outside the map limits"));
    }
    Ok(position)
}

fn parse_u16(value: Option<&str>, what: &str) -> Result<u16, String> {
    let value = value.ok_or_else(|| format!("command missing {what}"))?;
    value
        .parse::<u16>()
        .map_err(|_| format!("command expected {what}, got '{value}'"))
}
