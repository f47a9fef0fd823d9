pub mod codec;
mod config;
pub mod console;
pub mod edit;
pub mod editor;
pub mod entities;
pub mod error;
pub mod net;
pub mod persistence;
pub mod session;
pub mod telemetry;
pub mod world;

pub use config::{AppConfig, SessionSettings};
pub use editor::{EditOutcome, Editor, EditorOptions};
pub use error::{CodecError, ConflictError, EditorError, NetworkError};

use console::ConsoleCommand;
use session::{ClientState, SessionEvent};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use world::map::{DEFAULT_MAP_HEIGHT, DEFAULT_MAP_WIDTH};

const USAGE: &str = "usage: mapedit [--config FILE] new OUT [WIDTH HEIGHT] | info MAP | host MAP [PORT] | join ADDRESS PORT [OUT]";
const CONSOLE_TICK: Duration = Duration::from_millis(50);

pub fn run(args: &[String]) -> Result<(), String> {
    let (config, args) = AppConfig::from_args(args)?;
    telemetry::logging::init(&config.log_dir, config.level_filter())?;
    let mut editor = Editor::new(config.editor_options());

    match args.get(1).map(String::as_str) {
        Some("new") => {
            let out = required(&args, 2, "output path")?;
            let width = optional_number(&args, 3, DEFAULT_MAP_WIDTH)?;
            let height = optional_number(&args, 4, DEFAULT_MAP_HEIGHT)?;
            editor
                .new_map(width, height)
                .map_err(|err| format!("new map failed: {err}"))?;
            let written = editor
                .save_map(Path::new(out))
                .map_err(|err| format!("save {} failed: {err}", out))?;
            println!("mapedit: wrote {} ({} bytes, {}x{})", out, written, width, height);
            Ok(())
        }
        Some("info") => {
            let path = required(&args, 2, "map path")?;
            load(&mut editor, path)?;
            print_info(&editor, path)
        }
        Some("host") => {
            let path = required(&args, 2, "map path")?;
            let port = optional_number(&args, 3, config.session.port)?;
            load(&mut editor, path)?;
            let addr = editor
                .host_session(port)
                .map_err(|err| format!("host on port {} failed: {err}", port))?;
            println!("mapedit: hosting {} on {}", path, addr);
            run_console(&mut editor)
        }
        Some("join") => {
            let address = required(&args, 2, "host address")?;
            let port = optional_number(&args, 3, config.session.port)?;
            editor
                .join_session(address, port)
                .map_err(|err| format!("join {}:{} failed: {err}", address, port))?;
            println!("mapedit: joined {}:{}", address, port);
            if let Some(out) = args.get(4) {
                let written = editor
                    .save_map(Path::new(out))
                    .map_err(|err| format!("save {} failed: {err}", out))?;
                println!("mapedit: wrote snapshot to {} ({} bytes)", out, written);
            }
            run_console(&mut editor)
        }
        _ => Err(USAGE.to_string()),
    }
}

fn required<'a>(args: &'a [String], index: usize, what: &str) -> Result<&'a str, String> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {what}\n{USAGE}"))
}

fn optional_number<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> Result<T, String> {
    match args.get(index) {
        Some(value) => value
            .parse()
            .map_err(|_| format!("invalid number '{value}'\n{USAGE}")),
        None => Ok(default),
    }
}

fn load(editor: &mut Editor, path: &str) -> Result<(), String> {
    editor
        .load_map(Path::new(path))
        .map_err(|err| format!("load {} failed: {err}", path))
}

fn print_info(editor: &Editor, path: &str) -> Result<(), String> {
    let store = editor.read().map_err(|err| err.to_string())?;
    let metadata = store.metadata();
    let stats = store.stats();
    println!("mapedit: {}", path);
    println!("- version: {}", metadata.version);
    println!("- size: {}x{}", metadata.width, metadata.height);
    println!(
        "- items version: {}.{}",
        metadata.items_major, metadata.items_minor
    );
    if !metadata.description.is_empty() {
        println!("- description: {}", metadata.description);
    }
    println!("- tiles: {}", stats.tiles);
    println!("- items: {}", stats.items);
    println!("- creatures: {}", stats.creatures);
    println!("- houses: {} ({} tiles)", stats.houses, stats.house_tiles);
    println!("- towns: {}", stats.towns);
    println!("- waypoints: {}", stats.waypoints);
    println!("- spawns: {}", stats.spawns);
    println!("- sectors: {}", stats.sectors);
    print_index_stats(&store);
    Ok(())
}

fn print_index_stats(store: &world::MapStore) {
    let index = store.index_stats();
    println!(
        "- sector pool: {} allocated, {} reused, {} parked, {} reclaimed",
        index.sectors_allocated, index.sectors_reused, index.sectors_parked, index.sectors_reclaimed
    );
}

/// Reads shell commands from stdin while draining session events, until
/// `quit` or end of input.
fn run_console(editor: &mut Editor) -> Result<(), String> {
    let (tx, rx) = mpsc::channel::<String>();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        for event in editor.poll() {
            report_event(&event);
        }
        match rx.recv_timeout(CONSOLE_TICK) {
            Ok(line) => match console::parse_console_command(&line) {
                Ok(Some(ConsoleCommand::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(err) = execute(editor, command) {
                        eprintln!("mapedit: {}", err);
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("mapedit: {}", err),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    editor.close_session();
    for event in editor.poll() {
        report_event(&event);
    }
    println!("mapedit: session closed");
    Ok(())
}

fn execute(editor: &mut Editor, command: ConsoleCommand) -> Result<(), String> {
    if let Some(batch) = command.to_batch() {
        let outcome = editor
            .apply_local_edit(batch)
            .map_err(|err| format!("edit failed: {err}"))?;
        report_outcome("edit", &outcome);
        return Ok(());
    }
    match command {
        ConsoleCommand::Undo => match editor.undo().map_err(|err| format!("undo failed: {err}"))? {
            Some(outcome) => report_outcome("undo", &outcome),
            None => println!("mapedit: nothing to undo"),
        },
        ConsoleCommand::Redo => match editor.redo().map_err(|err| format!("redo failed: {err}"))? {
            Some(outcome) => report_outcome("redo", &outcome),
            None => println!("mapedit: nothing to redo"),
        },
        ConsoleCommand::Save { path } => {
            let path: PathBuf = path
                .or_else(|| editor.map_path().map(Path::to_path_buf))
                .ok_or_else(|| "save needs a path".to_string())?;
            let written = editor
                .save_map(&path)
                .map_err(|err| format!("save {} failed: {err}", path.display()))?;
            println!("mapedit: saved {} ({} bytes)", path.display(), written);
        }
        ConsoleCommand::Status => {
            let store = editor.read().map_err(|err| err.to_string())?;
            println!(
                "mapedit: {} revision={} tiles={} history={}",
                editor.role_name(),
                store.revision(),
                store.tile_count(),
                editor.ledger().len()
            );
            print_index_stats(&store);
            if let Some(state) = editor.client_state() {
                println!("- client: {:?}", state);
            }
            if let Some(addr) = editor.host_addr() {
                println!("- listening: {}", addr);
            }
        }
        ConsoleCommand::Reconnect => {
            editor
                .reconnect()
                .map_err(|err| format!("reconnect failed: {err}"))?;
            println!("mapedit: reconnected");
        }
        ConsoleCommand::Unknown(name) => return Err(format!("unknown command '{name}'")),
        _ => {}
    }
    Ok(())
}

fn report_outcome(what: &str, outcome: &EditOutcome) {
    match outcome {
        EditOutcome::Applied(applied) => {
            println!("mapedit: {} applied to {} tiles", what, applied.touched.len())
        }
        EditOutcome::Submitted(id) => println!("mapedit: {} {} sent to host", what, id.0),
    }
}

fn report_event(event: &SessionEvent) {
    match event {
        SessionEvent::ClientJoined { session_id, name } => {
            println!("mapedit: client {} ({}) joined", session_id, name)
        }
        SessionEvent::ClientLeft { session_id, reason } => {
            println!("mapedit: client {} left: {}", session_id, reason)
        }
        SessionEvent::LocalApplied(applied) => {
            println!("mapedit: batch {} confirmed ({} tiles)", applied.id.0, applied.touched.len())
        }
        SessionEvent::RemoteApplied {
            applied,
            originator,
        } => println!(
            "mapedit: batch {} from session {} applied ({} tiles)",
            applied.id.0,
            originator,
            applied.touched.len()
        ),
        SessionEvent::Rejected { batch_id, conflict } => {
            println!("mapedit: batch {} rejected: {}", batch_id.0, conflict)
        }
        SessionEvent::Resynced { region, revision } => {
            println!("mapedit: resynced {:?} at revision {}", region, revision)
        }
        SessionEvent::StateChanged(ClientState::Disconnected { reason }) => {
            println!("mapedit: disconnected: {} (type 'reconnect' to resync)", reason)
        }
        SessionEvent::StateChanged(state) => println!("mapedit: client state {:?}", state),
    }
}
