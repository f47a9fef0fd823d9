pub mod commands;

pub use commands::{parse_console_command, ConsoleCommand};
