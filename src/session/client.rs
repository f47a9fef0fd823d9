use crate::codec;
use crate::edit::change::{BatchId, ChangeBatch};
use crate::error::{CodecError, NetworkError};
use crate::net::protocol::{digest_text, snapshot_digest, BatchMessage, Message, PROTOCOL_VERSION};
use crate::net::transport::{FrameTransport, ReadOutcome, TcpFrameTransport};
use crate::session::{poisoned, SessionConfig, SessionControl, SessionEvent, SessionId, POLL_INTERVAL};
use crate::world::map::MapStore;
use crate::world::region::Region;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Syncing,
    Live { session_id: SessionId },
    Disconnected { reason: String },
}

/// What handling one host message produced.
#[derive(Debug, Default)]
pub struct Handled {
    pub events: Vec<SessionEvent>,
    pub replies: Vec<Message>,
    /// Set when the host ended the session.
    pub leave: Option<String>,
}

/// Client side of the protocol, free of any I/O.
#[derive(Debug)]
pub struct ClientCore {
    state: ClientState,
    pending: BTreeMap<BatchId, ChangeBatch>,
    out_seq: u64,
    in_seq: u64,
}

impl Default for ClientCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientCore {
    pub fn new() -> Self {
        ClientCore {
            state: ClientState::Connecting,
            pending: BTreeMap::new(),
            out_seq: 0,
            in_seq: 0,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self.state {
            ClientState::Live { session_id } => Some(session_id),
            _ => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Enters `Syncing` and returns the greeting to send.
    pub fn begin_sync(&mut self, name: &str) -> Message {
        self.state = ClientState::Syncing;
        self.pending.clear();
        self.out_seq = 0;
        self.in_seq = 0;
        Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
        }
    }

    /// Verifies and decodes the host's full snapshot, then goes `Live`.
    pub fn accept_snapshot(&mut self, message: Message) -> Result<MapStore, NetworkError> {
        if self.state != ClientState::Syncing {
            return Err(CodecError::corrupt("snapshot outside of sync").into());
        }
        match message {
            Message::FullSnapshot {
                session_id,
                revision,
                digest,
                encoded_map,
            } => {
                let actual = snapshot_digest(&encoded_map);
                if actual != digest {
                    return Err(CodecError::corrupt(format!(
                        "snapshot digest {} does not match {}",
                        digest_text(&actual),
                        digest_text(&digest)
                    ))
                    .into());
                }
                let mut store = codec::decode_slice(&encoded_map)?;
                store.set_revision(revision);
                self.state = ClientState::Live { session_id };
                log::info!(
                    "synced as session {} at revision {} ({} tiles)",
                    session_id,
                    revision,
                    store.tile_count()
                );
                Ok(store)
            }
            Message::Goodbye { reason } => Err(NetworkError::lost(reason)),
            other => Err(CodecError::corrupt(format!("expected full snapshot, got {}", other.name())).into()),
        }
    }

    /// Wraps a local batch for the host and keeps it until acknowledged.
    pub fn submit(&mut self, batch: ChangeBatch, base_revision: u64) -> Result<Message, NetworkError> {
        let Some(session_id) = self.session_id() else {
            return Err(NetworkError::lost("not connected to a host"));
        };
        self.out_seq += 1;
        self.pending.insert(batch.id, batch.clone());
        Ok(Message::ChangeBatch(BatchMessage {
            seq: self.out_seq,
            originator: session_id,
            base_revision,
            revision: 0,
            batch,
        }))
    }

    pub fn handle(&mut self, message: Message, store: &mut MapStore) -> Result<Handled, NetworkError> {
        let mut handled = Handled::default();
        match message {
            Message::ChangeBatch(batch) => self.remote_batch(batch, store, &mut handled)?,
            Message::Ack { batch_id, revision } => {
                let Some(batch) = self.pending.remove(&batch_id) else {
                    log::warn!("ack for unknown batch {}", batch_id.0);
                    return Ok(handled);
                };
                let touched = store.touched_by(&batch);
                match store.apply(&batch) {
                    Ok(applied) => {
                        store.set_revision(revision);
                        handled.events.push(SessionEvent::LocalApplied(applied));
                    }
                    Err(conflict) => {
                        log::warn!("acknowledged batch {} failed locally: {}", batch_id.0, conflict);
                        if let Some(region) = Region::bounding(touched) {
                            handled.replies.push(Message::ResyncRequest { region });
                        }
                        handled
                            .events
                            .push(SessionEvent::Rejected { batch_id, conflict });
                    }
                }
            }
            Message::Reject {
                batch_id,
                reason,
                region,
            } => {
                self.pending.remove(&batch_id);
                log::info!("batch {} rejected: {}", batch_id.0, reason);
                if let Some(region) = region {
                    handled.replies.push(Message::ResyncRequest { region });
                }
                handled.events.push(SessionEvent::Rejected {
                    batch_id,
                    conflict: reason,
                });
            }
            Message::RegionSnapshot {
                revision,
                region,
                tiles,
            } => {
                let tiles = codec::decode_tiles(&tiles)?;
                store
                    .replace_region(region, tiles)
                    .map_err(|err| CodecError::corrupt(format!("region snapshot: {}", err)))?;
                let revision = revision.max(store.revision());
                store.set_revision(revision);
                handled.events.push(SessionEvent::Resynced { region, revision });
            }
            Message::Ping => handled.replies.push(Message::Pong),
            Message::Pong => {}
            Message::Goodbye { reason } => {
                self.disconnect(reason.clone());
                handled.leave = Some(reason);
            }
            other => {
                return Err(CodecError::corrupt(format!("unexpected {} from host", other.name())).into());
            }
        }
        Ok(handled)
    }

    fn remote_batch(
        &mut self,
        message: BatchMessage,
        store: &mut MapStore,
        handled: &mut Handled,
    ) -> Result<(), NetworkError> {
        if message.seq <= self.in_seq {
            log::debug!("duplicate batch seq {} dropped", message.seq);
            return Ok(());
        }
        if message.seq != self.in_seq + 1 {
            return Err(CodecError::corrupt(format!(
                "sequence jumped from {} to {}",
                self.in_seq, message.seq
            ))
            .into());
        }
        self.in_seq = message.seq;
        if Some(message.originator) == self.session_id() {
            log::warn!("host echoed our own batch {}", message.batch.id.0);
            return Ok(());
        }
        let touched = store.touched_by(&message.batch);
        match store.apply(&message.batch) {
            Ok(applied) => {
                store.set_revision(message.revision);
                handled.events.push(SessionEvent::RemoteApplied {
                    applied,
                    originator: message.originator,
                });
            }
            Err(conflict) => {
                log::warn!(
                    "remote batch {} did not apply ({}), requesting resync",
                    message.batch.id.0,
                    conflict
                );
                if let Some(region) = Region::bounding(touched) {
                    handled.replies.push(Message::ResyncRequest { region });
                }
            }
        }
        Ok(())
    }

    /// Moves to `Disconnected` and drops unacknowledged batches. Returns how many were dropped.
    pub fn disconnect(&mut self, reason: impl Into<String>) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        self.state = ClientState::Disconnected {
            reason: reason.into(),
        };
        discarded
    }
}

struct ClientShared {
    store: Arc<RwLock<MapStore>>,
    core: Mutex<ClientCore>,
    events: Mutex<Sender<SessionEvent>>,
    config: SessionConfig,
}

impl ClientShared {
    fn emit(&self, event: SessionEvent) {
        if let Ok(events) = self.events.lock() {
            let _ = events.send(event);
        }
    }

    fn state(&self) -> ClientState {
        self.core
            .lock()
            .map(|core| core.state().clone())
            .unwrap_or_else(|_| ClientState::Disconnected {
                reason: "client state lock poisoned".to_string(),
            })
    }

    fn disconnect(&self, reason: String) {
        let discarded = self
            .core
            .lock()
            .map(|mut core| core.disconnect(reason.clone()))
            .unwrap_or_default();
        log::info!("disconnected ({}), {} pending batches discarded", reason, discarded);
        self.emit(SessionEvent::StateChanged(ClientState::Disconnected { reason }));
    }
}

struct Link {
    control: Arc<SessionControl>,
    outbound: Sender<Message>,
    handle: JoinHandle<()>,
}

/// A client connection to a host, running on its own thread.
pub struct ClientSession {
    addr: SocketAddr,
    shared: Arc<ClientShared>,
    link: Option<Link>,
}

impl ClientSession {
    /// Connects, performs the handshake and replaces `store` with the host's snapshot.
    pub fn connect(
        address: &str,
        port: u16,
        store: Arc<RwLock<MapStore>>,
        config: SessionConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Self, NetworkError> {
        let addr = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetworkError::lost(format!("{}:{} did not resolve", address, port)))?;
        let mut session = ClientSession {
            addr,
            shared: Arc::new(ClientShared {
                store,
                core: Mutex::new(ClientCore::new()),
                events: Mutex::new(events),
                config,
            }),
            link: None,
        };
        session.establish()?;
        Ok(session)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state(), ClientState::Live { .. })
    }

    pub fn pending(&self) -> usize {
        self.shared
            .core
            .lock()
            .map(|core| core.pending_len())
            .unwrap_or_default()
    }

    /// Sends a batch to the host. It reaches the local store only once acknowledged.
    pub fn submit(&self, batch: ChangeBatch) -> Result<BatchId, NetworkError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| NetworkError::lost("not connected to a host"))?;
        let batch_id = batch.id;
        let message = {
            let store = self.shared.store.read().map_err(poisoned)?;
            let mut core = self.shared.core.lock().map_err(poisoned)?;
            core.submit(batch, store.revision())?
        };
        link.outbound
            .send(message)
            .map_err(|_| NetworkError::lost("session thread stopped"))?;
        Ok(batch_id)
    }

    /// Drops the current connection, if any, and syncs again from scratch.
    pub fn reconnect(&mut self) -> Result<(), NetworkError> {
        self.stop_link("reconnecting");
        self.establish()
    }

    pub fn close(&mut self) {
        if self.link.is_some() {
            self.stop_link("client left");
        }
    }

    fn stop_link(&mut self, reason: &str) {
        let Some(link) = self.link.take() else {
            return;
        };
        let _ = link.outbound.send(Message::Goodbye {
            reason: reason.to_string(),
        });
        link.control.request_shutdown();
        if link.handle.join().is_err() {
            log::error!("client session thread panicked");
        }
    }

    fn establish(&mut self) -> Result<(), NetworkError> {
        let result = self.handshake();
        match result {
            Ok(transport) => {
                let control = Arc::new(SessionControl::new());
                let (outbound, outbound_rx) = mpsc::channel();
                let shared = Arc::clone(&self.shared);
                let thread_control = Arc::clone(&control);
                let handle =
                    thread::spawn(move || run_link(shared, thread_control, transport, outbound_rx));
                self.link = Some(Link {
                    control,
                    outbound,
                    handle,
                });
                Ok(())
            }
            Err(err) => {
                self.shared.disconnect(err.to_string());
                Err(err)
            }
        }
    }

    fn handshake(&self) -> Result<TcpFrameTransport, NetworkError> {
        let config = &self.shared.config;
        let mut transport = TcpFrameTransport::connect(self.addr, config.timeout, config.max_frame)?;
        transport.set_read_timeout(Some(POLL_INTERVAL))?;
        let hello = self.shared.core.lock().map_err(poisoned)?.begin_sync(&config.name);
        self.shared.emit(SessionEvent::StateChanged(ClientState::Syncing));
        transport.send(&hello)?;

        let started = Instant::now();
        loop {
            match transport.read_frame()? {
                ReadOutcome::Frame(body) => {
                    let message = Message::decode(&body)?;
                    let snapshot = self
                        .shared
                        .core
                        .lock()
                        .map_err(poisoned)?
                        .accept_snapshot(message)?;
                    *self.shared.store.write().map_err(poisoned)? = snapshot;
                    let state = self.shared.state();
                    self.shared.emit(SessionEvent::StateChanged(state));
                    return Ok(transport);
                }
                ReadOutcome::Timeout if started.elapsed() >= config.timeout => {
                    return Err(NetworkError::Timeout);
                }
                ReadOutcome::Timeout => {}
                ReadOutcome::Closed => return Err(NetworkError::lost("host closed during sync")),
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_link(
    shared: Arc<ClientShared>,
    control: Arc<SessionControl>,
    mut transport: TcpFrameTransport,
    outbound: Receiver<Message>,
) {
    let reason = match serve_link(&shared, &control, &mut transport, &outbound) {
        Ok(reason) => reason,
        Err(err @ NetworkError::FrameTooLarge { .. }) => {
            log::error!("dropping host link: {}", err);
            err.to_string()
        }
        Err(err) => {
            log::warn!("connection to host lost: {}", err);
            err.to_string()
        }
    };
    transport.shutdown();
    shared.disconnect(reason);
}

fn serve_link(
    shared: &ClientShared,
    control: &SessionControl,
    transport: &mut TcpFrameTransport,
    outbound: &Receiver<Message>,
) -> Result<String, NetworkError> {
    let mut last_heard = Instant::now();
    let mut last_ping: Option<Instant> = None;
    while control.is_running() {
        if let Some(reason) = flush_outbound(outbound, transport)? {
            return Ok(reason);
        }
        match transport.read_frame()? {
            ReadOutcome::Frame(body) => {
                last_heard = Instant::now();
                let message = Message::decode(&body)?;
                let handled = {
                    let mut store = shared.store.write().map_err(poisoned)?;
                    let mut core = shared.core.lock().map_err(poisoned)?;
                    core.handle(message, &mut store)?
                };
                for reply in &handled.replies {
                    transport.send(reply)?;
                }
                for event in handled.events {
                    shared.emit(event);
                }
                if let Some(reason) = handled.leave {
                    return Ok(reason);
                }
            }
            ReadOutcome::Timeout => {
                let silent = last_heard.elapsed();
                if silent >= shared.config.timeout {
                    return Err(NetworkError::Timeout);
                }
                let ping_due = last_ping.map_or(true, |at| at.elapsed() >= shared.config.ping_interval);
                if silent >= shared.config.ping_interval && ping_due {
                    transport.send(&Message::Ping)?;
                    last_ping = Some(Instant::now());
                }
            }
            ReadOutcome::Closed => return Err(NetworkError::lost("host closed the connection")),
        }
    }
    Ok(flush_outbound(outbound, transport)?.unwrap_or_else(|| "session closed".to_string()))
}

fn flush_outbound(
    outbound: &Receiver<Message>,
    transport: &mut TcpFrameTransport,
) -> Result<Option<String>, NetworkError> {
    loop {
        match outbound.try_recv() {
            Ok(message) => {
                transport.send(&message)?;
                if let Message::Goodbye { reason } = message {
                    return Ok(Some(reason));
                }
            }
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => return Ok(Some("session closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::change::Change;
    use crate::entities::item::Item;
    use crate::error::ConflictError;
    use crate::world::position::Position;

    fn live_core(store: &MapStore) -> ClientCore {
        let mut core = ClientCore::new();
        core.begin_sync("tester");
        let encoded_map = codec::encode_to_vec(store).expect("encode");
        core.accept_snapshot(Message::FullSnapshot {
            session_id: 4,
            revision: 9,
            digest: snapshot_digest(&encoded_map),
            encoded_map,
        })
        .expect("snapshot");
        core
    }

    fn add_item(x: u16, type_id: u16) -> ChangeBatch {
        ChangeBatch::single(Change::AddItem {
            position: Position::new(x, 1, 7),
            index: None,
            item: Item::new(type_id),
        })
    }

    fn remote(seq: u64, revision: u64, batch: ChangeBatch) -> Message {
        Message::ChangeBatch(BatchMessage {
            seq,
            originator: 2,
            base_revision: revision - 1,
            revision,
            batch,
        })
    }

    #[test]
    fn snapshot_with_bad_digest_is_refused() {
        let mut core = ClientCore::new();
        core.begin_sync("tester");
        let err = core
            .accept_snapshot(Message::FullSnapshot {
                session_id: 1,
                revision: 0,
                digest: [0; 20],
                encoded_map: codec::encode_to_vec(&MapStore::new(8, 8)).expect("encode"),
            })
            .unwrap_err();
        assert!(matches!(err, NetworkError::Malformed(CodecError::Corrupt(_))));
        assert_eq!(core.state(), &ClientState::Syncing);
    }

    #[test]
    fn own_batch_lands_only_on_ack() {
        let mut store = MapStore::new(32, 32);
        let mut core = live_core(&store);
        store.set_revision(9);
        let batch = add_item(1, 100);
        let id = batch.id;
        let message = core.submit(batch, store.revision()).expect("submit");
        assert!(matches!(&message, Message::ChangeBatch(m) if m.seq == 1 && m.originator == 4));
        assert!(store.tile(Position::new(1, 1, 7)).is_none());

        let handled = core
            .handle(Message::Ack { batch_id: id, revision: 10 }, &mut store)
            .expect("ack");
        assert!(matches!(handled.events.as_slice(), [SessionEvent::LocalApplied(_)]));
        assert_eq!(store.revision(), 10);
        assert!(store.tile(Position::new(1, 1, 7)).is_some());
        assert_eq!(core.pending_len(), 0);
    }

    #[test]
    fn reject_requests_resync_of_region() {
        let mut store = MapStore::new(32, 32);
        let mut core = live_core(&store);
        let batch = add_item(1, 100);
        let id = batch.id;
        core.submit(batch, 0).expect("submit");
        let region = Region::single(Position::new(1, 1, 7));
        let handled = core
            .handle(
                Message::Reject {
                    batch_id: id,
                    reason: ConflictError::TileLocked {
                        position: Position::new(1, 1, 7),
                        holder: 2,
                    },
                    region: Some(region),
                },
                &mut store,
            )
            .expect("reject");
        assert_eq!(handled.replies, vec![Message::ResyncRequest { region }]);
        assert!(matches!(
            handled.events.as_slice(),
            [SessionEvent::Rejected { conflict: ConflictError::TileLocked { .. }, .. }]
        ));
        assert_eq!(core.pending_len(), 0);
    }

    #[test]
    fn remote_batches_apply_in_sequence() {
        let mut store = MapStore::new(32, 32);
        let mut core = live_core(&store);
        core.handle(remote(1, 10, add_item(2, 100)), &mut store)
            .expect("first");
        let duplicate = core
            .handle(remote(1, 10, add_item(2, 100)), &mut store)
            .expect("duplicate");
        assert!(duplicate.events.is_empty());
        assert_eq!(store.tile(Position::new(2, 1, 7)).map(|tile| tile.items.len()), Some(1));
        assert_eq!(store.revision(), 10);

        let gap = core.handle(remote(3, 12, add_item(3, 100)), &mut store);
        assert!(matches!(gap, Err(NetworkError::Malformed(_))));
    }

    #[test]
    fn region_snapshot_replaces_tiles() {
        let mut host = MapStore::new(32, 32);
        host.apply(&add_item(5, 300)).expect("host edit");
        let mut store = MapStore::new(32, 32);
        store.apply(&add_item(6, 100)).expect("stale edit");
        let mut core = live_core(&store);
        let region = Region::new(Position::new(0, 0, 7), Position::new(10, 5, 7));
        let handled = core
            .handle(
                Message::RegionSnapshot {
                    revision: 20,
                    region,
                    tiles: codec::encode_tiles(&host, region).expect("tiles"),
                },
                &mut store,
            )
            .expect("snapshot");
        assert!(matches!(handled.events.as_slice(), [SessionEvent::Resynced { revision: 20, .. }]));
        assert!(store.tile(Position::new(6, 1, 7)).is_none());
        assert_eq!(
            store.tile(Position::new(5, 1, 7)).and_then(|tile| tile.top_item()).map(|item| item.type_id.0),
            Some(300)
        );
    }

    #[test]
    fn disconnect_discards_pending_and_blocks_submit() {
        let store = MapStore::new(32, 32);
        let mut core = live_core(&store);
        core.submit(add_item(1, 1), 0).expect("submit");
        core.submit(add_item(2, 1), 0).expect("submit");
        assert_eq!(core.disconnect("link dropped"), 2);
        assert!(matches!(core.state(), ClientState::Disconnected { .. }));
        assert!(core.submit(add_item(3, 1), 0).is_err());

        core.begin_sync("tester");
        assert_eq!(core.state(), &ClientState::Syncing);
    }

    #[test]
    fn host_goodbye_ends_session() {
        let mut store = MapStore::new(32, 32);
        let mut core = live_core(&store);
        let handled = core
            .handle(
                Message::Goodbye {
                    reason: "host closed the session".to_string(),
                },
                &mut store,
            )
            .expect("goodbye");
        assert_eq!(handled.leave.as_deref(), Some("host closed the session"));
        assert!(matches!(core.state(), ClientState::Disconnected { .. }));
        assert!(core.handle(Message::Hello { protocol_version: 5, name: String::new() }, &mut store).is_err());
    }
}
