//! Command surface for a GUI or CLI shell.

use crate::edit::apply::AppliedBatch;
use crate::edit::change::{BatchId, ChangeBatch};
use crate::edit::ledger::{Ledger, Origin, DEFAULT_UNDO_CAPACITY};
use crate::error::EditorError;
use crate::persistence::autosave::{Autosave, AutosaveConfig};
use crate::persistence::mapfile;
use crate::session::{ClientSession, ClientState, HostSession, SessionConfig, SessionEvent};
use crate::world::map::{MapMetadata, MapStore};
use crate::world::sector::DEFAULT_VACANT_POOL;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct EditorOptions {
    pub undo_capacity: usize,
    pub vacant_sector_pool: usize,
    pub session: SessionConfig,
    pub autosave: AutosaveConfig,
}

impl Default for EditorOptions {
    fn default() -> Self {
        EditorOptions {
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            vacant_sector_pool: DEFAULT_VACANT_POOL,
            session: SessionConfig::default(),
            autosave: AutosaveConfig { interval_seconds: 0 },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The batch is already in the local store.
    Applied(AppliedBatch),
    /// Sent to the host; it reaches the store when acknowledged.
    Submitted(BatchId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Undo,
    Redo,
}

enum Role {
    Standalone,
    Host(HostSession),
    Client(ClientSession),
}

pub struct Editor {
    options: EditorOptions,
    store: Arc<RwLock<MapStore>>,
    ledger: Ledger,
    role: Role,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    /// Undo/redo batches submitted to the host, with the ledger generation
    /// right after the cursor moved.
    replays: HashMap<BatchId, (Replay, u64)>,
    map_path: Option<PathBuf>,
    autosave: Option<Autosave>,
}

impl Editor {
    pub fn new(options: EditorOptions) -> Self {
        let store = MapStore::with_metadata(MapMetadata::default(), options.vacant_sector_pool);
        let (events_tx, events_rx) = mpsc::channel();
        Editor {
            ledger: Ledger::new(options.undo_capacity),
            options,
            store: Arc::new(RwLock::new(store)),
            role: Role::Standalone,
            events_tx,
            events_rx,
            replays: HashMap::new(),
            map_path: None,
            autosave: None,
        }
    }

    /// Shared handle for readers such as a renderer.
    pub fn store(&self) -> Arc<RwLock<MapStore>> {
        Arc::clone(&self.store)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, MapStore>, EditorError> {
        self.store.read().map_err(|_| EditorError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MapStore>, EditorError> {
        self.store.write().map_err(|_| EditorError::Poisoned)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn map_path(&self) -> Option<&Path> {
        self.map_path.as_deref()
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            Role::Standalone => "standalone",
            Role::Host(_) => "host",
            Role::Client(_) => "client",
        }
    }

    pub fn client_state(&self) -> Option<ClientState> {
        match &self.role {
            Role::Client(client) => Some(client.state()),
            _ => None,
        }
    }

    pub fn host_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Host(host) => Some(host.local_addr()),
            _ => None,
        }
    }

    fn require_standalone(&self) -> Result<(), EditorError> {
        match self.role {
            Role::Standalone => Ok(()),
            _ => Err(EditorError::SessionActive),
        }
    }

    fn reset_history(&mut self) {
        self.ledger.clear();
        self.replays.clear();
    }

    pub fn new_map(&mut self, width: u16, height: u16) -> Result<(), EditorError> {
        self.require_standalone()?;
        let store = MapStore::with_metadata(MapMetadata::new(width, height), self.options.vacant_sector_pool);
        *self.write()? = store;
        self.reset_history();
        self.map_path = None;
        self.autosave = None;
        log::info!("new map {}x{}", width, height);
        Ok(())
    }

    pub fn load_map(&mut self, path: &Path) -> Result<(), EditorError> {
        self.require_standalone()?;
        let store = mapfile::load_map(path)?;
        let revision = store.revision();
        *self.write()? = store;
        self.reset_history();
        self.track_path(path, revision);
        Ok(())
    }

    pub fn save_map(&mut self, path: &Path) -> Result<u64, EditorError> {
        let (written, revision) = {
            let store = self.read()?;
            (mapfile::save_map(path, &store)?, store.revision())
        };
        self.track_path(path, revision);
        Ok(written)
    }

    fn track_path(&mut self, path: &Path, saved_revision: u64) {
        self.map_path = Some(path.to_path_buf());
        let now = Instant::now();
        let same_target = self
            .autosave
            .as_ref()
            .map_or(false, |autosave| autosave.path() == path);
        if same_target {
            if let Some(autosave) = self.autosave.as_mut() {
                autosave.mark_saved(saved_revision, now);
            }
        } else if self.options.autosave.interval().is_some() {
            self.autosave = Some(Autosave::new(self.options.autosave, path, saved_revision, now));
        }
    }

    /// Standalone and host edits apply at once; client edits go to the host first.
    pub fn apply_local_edit(&mut self, batch: ChangeBatch) -> Result<EditOutcome, EditorError> {
        match &self.role {
            Role::Standalone => {
                let applied = self.write()?.apply(&batch)?;
                self.ledger.push(applied.clone(), Origin::Local);
                self.ledger.drain_outbound();
                Ok(EditOutcome::Applied(applied))
            }
            Role::Host(host) => {
                let mut store = self.store.write().map_err(|_| EditorError::Poisoned)?;
                let applied = host.apply_local(&mut store, &batch)?;
                self.ledger.push(applied.clone(), Origin::Local);
                relay_outbound(&mut self.ledger, host, store.revision())?;
                Ok(EditOutcome::Applied(applied))
            }
            Role::Client(client) => Ok(EditOutcome::Submitted(client.submit(batch)?)),
        }
    }

    /// `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self) -> Result<Option<EditOutcome>, EditorError> {
        self.replay(Replay::Undo)
    }

    /// `Ok(None)` when there is nothing to redo.
    pub fn redo(&mut self) -> Result<Option<EditOutcome>, EditorError> {
        self.replay(Replay::Redo)
    }

    fn replay(&mut self, kind: Replay) -> Result<Option<EditOutcome>, EditorError> {
        let batch = match kind {
            Replay::Undo => self.ledger.undo(),
            Replay::Redo => self.ledger.redo(),
        };
        let Some(batch) = batch else {
            return Ok(None);
        };
        let outcome = self.replay_batch(kind, batch);
        if outcome.is_err() {
            self.revert_cursor(kind);
        }
        outcome.map(Some)
    }

    fn replay_batch(&mut self, kind: Replay, batch: ChangeBatch) -> Result<EditOutcome, EditorError> {
        match &self.role {
            Role::Standalone => {
                let applied = self.write()?.apply(&batch)?;
                Ok(EditOutcome::Applied(applied))
            }
            Role::Host(host) => {
                let mut store = self.store.write().map_err(|_| EditorError::Poisoned)?;
                let applied = host.apply_local(&mut store, &batch)?;
                if !applied.is_noop() {
                    self.ledger.queue_outbound(applied.forward.clone());
                    relay_outbound(&mut self.ledger, host, store.revision())?;
                }
                Ok(EditOutcome::Applied(applied))
            }
            Role::Client(client) => {
                let batch_id = client.submit(batch)?;
                self.replays
                    .insert(batch_id, (kind, self.ledger.generation()));
                Ok(EditOutcome::Submitted(batch_id))
            }
        }
    }

    fn revert_cursor(&mut self, kind: Replay) {
        let _ = match kind {
            Replay::Undo => self.ledger.redo(),
            Replay::Redo => self.ledger.undo(),
        };
    }

    /// Starts hosting the current map on `port` (0 picks a free port).
    pub fn host_session(&mut self, port: u16) -> Result<SocketAddr, EditorError> {
        self.require_standalone()?;
        let host = HostSession::start(
            &format!("0.0.0.0:{}", port),
            Arc::clone(&self.store),
            self.options.session.clone(),
            self.events_tx.clone(),
        )?;
        let addr = host.local_addr();
        self.role = Role::Host(host);
        Ok(addr)
    }

    /// Joins a host; the local map is replaced by the host's snapshot.
    pub fn join_session(&mut self, address: &str, port: u16) -> Result<(), EditorError> {
        self.require_standalone()?;
        let client = ClientSession::connect(
            address,
            port,
            Arc::clone(&self.store),
            self.options.session.clone(),
            self.events_tx.clone(),
        )?;
        self.reset_history();
        self.map_path = None;
        self.autosave = None;
        self.role = Role::Client(client);
        Ok(())
    }

    /// Re-syncs a client whose connection dropped.
    pub fn reconnect(&mut self) -> Result<(), EditorError> {
        let Role::Client(client) = &mut self.role else {
            return Err(EditorError::NoSession);
        };
        client.reconnect()?;
        self.reset_history();
        Ok(())
    }

    /// Leaves or stops the active session. Does nothing when there is none.
    pub fn close_session(&mut self) {
        match std::mem::replace(&mut self.role, Role::Standalone) {
            Role::Standalone => {}
            Role::Host(mut host) => host.close(),
            Role::Client(mut client) => client.close(),
        }
        self.replays.clear();
    }

    /// Drains session events, records remote and acknowledged batches in the
    /// ledger, and runs autosave. Never blocks.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match &event {
                SessionEvent::LocalApplied(applied) => {
                    if self.replays.remove(&applied.id).is_none() {
                        self.ledger.push(applied.clone(), Origin::Local);
                        self.ledger.drain_outbound();
                    }
                }
                SessionEvent::RemoteApplied {
                    applied,
                    originator,
                } => self.ledger.push(
                    applied.clone(),
                    Origin::Remote {
                        originator: *originator,
                    },
                ),
                SessionEvent::Rejected { batch_id, .. } => {
                    if let Some((kind, generation)) = self.replays.remove(batch_id) {
                        if generation == self.ledger.generation() {
                            self.revert_cursor(kind);
                        }
                    }
                }
                SessionEvent::StateChanged(ClientState::Disconnected { .. }) => self.replays.clear(),
                _ => {}
            }
            events.push(event);
        }
        self.tick_autosave();
        events
    }

    fn tick_autosave(&mut self) {
        if matches!(self.role, Role::Client(_)) {
            return;
        }
        let Some(autosave) = self.autosave.as_mut() else {
            return;
        };
        let Ok(store) = self.store.read() else {
            return;
        };
        match autosave.tick(&store, Instant::now()) {
            Ok(true) => log::info!("autosaved {}", autosave.path().display()),
            Ok(false) => {}
            Err(err) => log::error!("autosave to {} failed: {}", autosave.path().display(), err),
        }
    }
}

impl Default for Editor {
    fn default() -> Self {
        Self::new(EditorOptions::default())
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        self.close_session();
    }
}

/// Hands queued local batches to the host while the caller still holds the store write lock.
fn relay_outbound(ledger: &mut Ledger, host: &HostSession, revision: u64) -> Result<(), EditorError> {
    for batch in ledger.drain_outbound() {
        host.broadcast(&batch, revision)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::change::Change;
    use crate::entities::item::Item;
    use crate::world::position::Position;

    fn place(x: u16, type_id: u16) -> ChangeBatch {
        ChangeBatch::single(Change::AddItem {
            position: Position::new(x, 10, 7),
            index: None,
            item: Item::new(type_id),
        })
    }

    fn items_at(editor: &Editor, x: u16) -> Vec<u16> {
        editor
            .read()
            .expect("read")
            .tile(Position::new(x, 10, 7))
            .map(|tile| tile.items.iter().map(|item| item.type_id.0).collect())
            .unwrap_or_default()
    }

    #[test]
    fn standalone_undo_redo_walks_history() {
        let mut editor = Editor::default();
        editor.new_map(64, 64).expect("new");
        assert!(editor.undo().expect("undo").is_none());

        editor.apply_local_edit(place(1, 100)).expect("edit");
        editor.apply_local_edit(place(1, 200)).expect("edit");
        assert_eq!(items_at(&editor, 1), vec![100, 200]);

        editor.undo().expect("undo");
        assert_eq!(items_at(&editor, 1), vec![100]);
        editor.redo().expect("redo");
        assert_eq!(items_at(&editor, 1), vec![100, 200]);
        assert!(editor.redo().expect("redo").is_none());
    }

    #[test]
    fn fresh_edit_after_undo_drops_redo_branch() {
        let mut editor = Editor::default();
        editor.apply_local_edit(place(1, 100)).expect("edit");
        editor.apply_local_edit(place(2, 100)).expect("edit");
        editor.undo().expect("undo");
        editor.redo().expect("redo");
        editor.undo().expect("undo");
        editor.apply_local_edit(place(3, 100)).expect("edit");
        assert!(editor.redo().expect("redo").is_none());
        assert!(items_at(&editor, 2).is_empty());
    }

    #[test]
    fn failed_edit_leaves_store_and_ledger_untouched() {
        let mut editor = Editor::default();
        let bad = ChangeBatch::new(vec![
            Change::AddItem {
                position: Position::new(1, 10, 7),
                index: None,
                item: Item::new(100),
            },
            Change::RemoveItem {
                position: Position::new(9, 10, 7),
                index: 0,
            },
        ]);
        assert!(matches!(
            editor.apply_local_edit(bad),
            Err(EditorError::Conflict(_))
        ));
        assert!(items_at(&editor, 1).is_empty());
        assert!(editor.ledger().is_empty());
    }

    #[test]
    fn session_commands_require_the_right_role() {
        let mut editor = Editor::default();
        assert!(matches!(editor.reconnect(), Err(EditorError::NoSession)));
        editor.close_session();
        let addr = editor.host_session(0).expect("host");
        assert_ne!(addr.port(), 0);
        assert!(matches!(editor.new_map(8, 8), Err(EditorError::SessionActive)));
        assert!(matches!(editor.host_session(0), Err(EditorError::SessionActive)));

        editor.apply_local_edit(place(4, 100)).expect("host edit");
        editor.undo().expect("host undo");
        assert!(items_at(&editor, 4).is_empty());
        editor.close_session();
        editor.close_session();
        assert_eq!(editor.role_name(), "standalone");
    }

    #[test]
    fn save_and_load_through_editor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("editor.otbm");
        let mut editor = Editor::default();
        editor.new_map(128, 128).expect("new");
        editor.apply_local_edit(place(10, 100)).expect("edit");
        editor.save_map(&path).expect("save");

        let mut other = Editor::default();
        other.load_map(&path).expect("load");
        assert_eq!(items_at(&other, 10), vec![100]);
        assert_eq!(other.map_path(), Some(path.as_path()));
        assert!(!other.ledger().can_undo());
    }
}
