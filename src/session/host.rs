use crate::codec;
use crate::edit::apply::AppliedBatch;
use crate::edit::change::ChangeBatch;
use crate::error::{CodecError, ConflictError, EditorError, NetworkError};
use crate::net::protocol::{digest_text, snapshot_digest, BatchMessage, Message, PROTOCOL_VERSION};
use crate::net::transport::{FrameTransport, ReadOutcome, TcpFrameTransport};
use crate::session::locks::TileLocks;
use crate::session::{
    poisoned, SessionConfig, SessionControl, SessionEvent, SessionId, HOST_SESSION_ID,
    POLL_INTERVAL,
};
use crate::world::map::MapStore;
use crate::world::position::Position;
use crate::world::region::Region;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHello,
    Active { name: String },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteStamp {
    session: SessionId,
    revision: u64,
}

/// Arbitration state of a host, free of any I/O.
#[derive(Debug)]
pub struct HostCore {
    locks: TileLocks,
    last_writer: HashMap<Position, WriteStamp>,
    connections: BTreeMap<SessionId, ConnectionState>,
    next_session: SessionId,
}

impl Default for HostCore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCore {
    pub fn new() -> Self {
        HostCore {
            locks: TileLocks::new(),
            last_writer: HashMap::new(),
            connections: BTreeMap::new(),
            next_session: HOST_SESSION_ID + 1,
        }
    }

    pub fn register(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        self.connections.insert(id, ConnectionState::AwaitingHello);
        id
    }

    pub fn hello(&mut self, session: SessionId, protocol_version: u32, name: &str) -> Result<(), NetworkError> {
        match self.connections.get(&session) {
            Some(ConnectionState::AwaitingHello) => {}
            _ => return Err(NetworkError::lost(format!("session {} is not awaiting hello", session))),
        }
        if protocol_version != PROTOCOL_VERSION {
            self.connections.insert(session, ConnectionState::Closed);
            return Err(NetworkError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: protocol_version,
            });
        }
        self.connections.insert(
            session,
            ConnectionState::Active {
                name: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn state(&self, session: SessionId) -> Option<&ConnectionState> {
        self.connections.get(&session)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.connections
            .iter()
            .filter(|(_, state)| matches!(state, ConnectionState::Active { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn locks(&self) -> &TileLocks {
        &self.locks
    }

    /// Decides whether a batch touching `touched` may go to the writer.
    /// On success the tiles stay locked for `session` until [`HostCore::release`].
    pub fn admit(
        &mut self,
        session: SessionId,
        touched: &BTreeSet<Position>,
        base_revision: u64,
    ) -> Result<(), ConflictError> {
        self.locks.check(session, touched)?;
        for position in touched {
            if let Some(stamp) = self.last_writer.get(position) {
                if stamp.session != session && stamp.revision > base_revision {
                    return Err(ConflictError::stale(
                        Some(*position),
                        format!(
                            "tile {} was changed by session {} at revision {}",
                            position, stamp.session, stamp.revision
                        ),
                    ));
                }
            }
        }
        self.locks.try_lock(session, touched)
    }

    /// Stamps every tile the batch wrote. `admitted` is the set locked at
    /// admission, `written` what the apply actually changed; either may hold
    /// tiles the other lacks when house membership moved in between.
    pub fn record_applied(
        &mut self,
        session: SessionId,
        admitted: &BTreeSet<Position>,
        written: &BTreeSet<Position>,
        revision: u64,
    ) {
        for position in admitted.union(written) {
            self.last_writer.insert(*position, WriteStamp { session, revision });
        }
    }

    pub fn release(&mut self, session: SessionId, touched: &BTreeSet<Position>) {
        self.locks.release(session, touched);
    }

    /// Closes the connection and force-releases its locks. Returns the freed tile count.
    pub fn disconnect(&mut self, session: SessionId) -> usize {
        self.connections.insert(session, ConnectionState::Closed);
        self.locks.release_all(session)
    }
}

struct Outbox {
    sender: Sender<Message>,
    next_seq: u64,
}

struct Admitted {
    session: SessionId,
    message: BatchMessage,
    touched: BTreeSet<Position>,
}

struct HostShared {
    store: Arc<RwLock<MapStore>>,
    core: Mutex<HostCore>,
    control: SessionControl,
    outboxes: Mutex<HashMap<SessionId, Outbox>>,
    admissions: Mutex<Sender<Admitted>>,
    events: Mutex<Sender<SessionEvent>>,
    config: SessionConfig,
}

impl HostShared {
    fn core(&self) -> Result<MutexGuard<'_, HostCore>, NetworkError> {
        self.core.lock().map_err(poisoned)
    }

    fn emit(&self, event: SessionEvent) {
        if let Ok(events) = self.events.lock() {
            // The editor may already be gone during shutdown.
            let _ = events.send(event);
        }
    }

    fn send_to(&self, session: SessionId, message: Message) -> Result<(), NetworkError> {
        let outboxes = self.outboxes.lock().map_err(poisoned)?;
        if let Some(outbox) = outboxes.get(&session) {
            if outbox.sender.send(message).is_err() {
                log::debug!("outbox of session {} is closed", session);
            }
        }
        Ok(())
    }

    /// Queues `batch` for every live connection except its originator.
    fn broadcast_batch(
        &self,
        batch: &ChangeBatch,
        originator: SessionId,
        base_revision: u64,
        revision: u64,
    ) -> Result<usize, NetworkError> {
        let mut outboxes = self.outboxes.lock().map_err(poisoned)?;
        let mut delivered = 0;
        for (session, outbox) in outboxes.iter_mut() {
            if *session == originator {
                continue;
            }
            let message = Message::ChangeBatch(BatchMessage {
                seq: outbox.next_seq,
                originator,
                base_revision,
                revision,
                batch: batch.clone(),
            });
            outbox.next_seq += 1;
            if outbox.sender.send(message).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn apply_admitted(&self, admitted: Admitted) -> Result<(), NetworkError> {
        let Admitted {
            session,
            message,
            touched,
        } = admitted;
        let batch_id = message.batch.id;
        let mut store = self.store.write().map_err(poisoned)?;
        let base_revision = store.revision();
        let outcome = store.apply(&message.batch);
        let mut core = self.core()?;
        match outcome {
            Ok(applied) => {
                let revision = store.revision();
                if !applied.is_noop() {
                    core.record_applied(session, &touched, &applied.touched, revision);
                }
                core.release(session, &touched);
                drop(core);
                self.send_to(session, Message::Ack { batch_id, revision })?;
                if !applied.is_noop() {
                    let delivered =
                        self.broadcast_batch(&applied.forward, session, base_revision, revision)?;
                    log::debug!(
                        "batch {} from session {} applied at revision {}, relayed to {} peers",
                        batch_id.0,
                        session,
                        revision,
                        delivered
                    );
                    drop(store);
                    self.emit(SessionEvent::RemoteApplied {
                        applied,
                        originator: session,
                    });
                }
            }
            Err(conflict) => {
                core.release(session, &touched);
                drop(core);
                log::info!(
                    "batch {} from session {} failed on apply: {}",
                    batch_id.0,
                    session,
                    conflict
                );
                let region = Region::bounding(touched.iter().copied());
                self.send_to(
                    session,
                    Message::Reject {
                        batch_id,
                        reason: conflict,
                        region,
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// A running host: accept thread, writer thread and one thread per client.
pub struct HostSession {
    shared: Arc<HostShared>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl HostSession {
    pub fn start(
        bind_addr: &str,
        store: Arc<RwLock<MapStore>>,
        config: SessionConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(bind_addr)
            .map_err(|err| NetworkError::lost(format!("bind {} failed: {}", bind_addr, err)))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (admit_tx, admit_rx) = mpsc::channel();
        let shared = Arc::new(HostShared {
            store,
            core: Mutex::new(HostCore::new()),
            control: SessionControl::new(),
            outboxes: Mutex::new(HashMap::new()),
            admissions: Mutex::new(admit_tx),
            events: Mutex::new(events),
            config,
        });

        let writer_shared = Arc::clone(&shared);
        let writer = thread::spawn(move || run_writer(writer_shared, admit_rx));
        let accept_shared = Arc::clone(&shared);
        let accept = thread::spawn(move || run_accept(accept_shared, listener));

        log::info!("hosting session on {}", local_addr);
        Ok(HostSession {
            shared,
            local_addr,
            threads: vec![accept, writer],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.control.is_running()
    }

    pub fn connected(&self) -> Vec<SessionId> {
        self.shared
            .core
            .lock()
            .map(|core| core.active_sessions())
            .unwrap_or_default()
    }

    pub fn locked_tiles(&self) -> usize {
        self.shared
            .core
            .lock()
            .map(|core| core.locks().len())
            .unwrap_or_default()
    }

    /// Applies a host edit through the same admission as client batches.
    /// `store` is the write guard the caller holds; broadcasting is the caller's
    /// next step, done before that guard is released.
    pub fn apply_local(&self, store: &mut MapStore, batch: &ChangeBatch) -> Result<AppliedBatch, EditorError> {
        let touched = store.touched_by(batch);
        let mut core = self.shared.core()?;
        core.admit(HOST_SESSION_ID, &touched, store.revision())?;
        let outcome = store.apply(batch);
        if let Ok(applied) = &outcome {
            if !applied.is_noop() {
                core.record_applied(HOST_SESSION_ID, &touched, &applied.touched, store.revision());
            }
        }
        core.release(HOST_SESSION_ID, &touched);
        Ok(outcome?)
    }

    /// Relays a host batch that was applied at `revision` to every client.
    pub fn broadcast(&self, batch: &ChangeBatch, revision: u64) -> Result<usize, NetworkError> {
        self.shared
            .broadcast_batch(batch, HOST_SESSION_ID, revision.saturating_sub(1), revision)
    }

    /// Says goodbye to every client and stops all threads. Safe to call twice.
    pub fn close(&mut self) {
        if self.shared.control.request_shutdown() {
            if let Ok(outboxes) = self.shared.outboxes.lock() {
                for outbox in outboxes.values() {
                    let _ = outbox.sender.send(Message::Goodbye {
                        reason: "host closed the session".to_string(),
                    });
                }
            }
            log::info!("closing session on {}", self.local_addr);
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("session thread panicked");
            }
        }
    }
}

impl Drop for HostSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_writer(shared: Arc<HostShared>, admissions: Receiver<Admitted>) {
    while shared.control.is_running() {
        match admissions.recv_timeout(POLL_INTERVAL) {
            Ok(admitted) => {
                if let Err(err) = shared.apply_admitted(admitted) {
                    log::error!("batch apply failed: {}", err);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_accept(shared: Arc<HostShared>, listener: TcpListener) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while shared.control.is_running() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("connection from {} dropped: {}", addr, err);
                    continue;
                }
                let transport = match TcpFrameTransport::new(stream, shared.config.max_frame) {
                    Ok(transport) => transport,
                    Err(err) => {
                        log::warn!("connection from {} dropped: {}", addr, err);
                        continue;
                    }
                };
                let session = match shared.core() {
                    Ok(mut core) => core.register(),
                    Err(err) => {
                        log::error!("accept failed: {}", err);
                        break;
                    }
                };
                log::info!("connection from {} is session {}", addr, session);
                let shared = Arc::clone(&shared);
                connections.push(thread::spawn(move || run_connection(shared, session, transport)));
                connections.retain(|handle| !handle.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(err) => {
                log::error!("accept failed: {}", err);
            }
        }
    }
    for handle in connections {
        if handle.join().is_err() {
            log::error!("connection thread panicked");
        }
    }
}

fn run_connection(shared: Arc<HostShared>, session: SessionId, mut transport: TcpFrameTransport) {
    let reason = match serve_connection(&shared, session, &mut transport) {
        Ok(reason) => reason,
        Err(err) => {
            match &err {
                NetworkError::Malformed(_)
                | NetworkError::ProtocolMismatch { .. }
                | NetworkError::FrameTooLarge { .. } => {
                    log::error!("session {} dropped: {}", session, err)
                }
                _ => log::warn!("session {} lost: {}", session, err),
            }
            err.to_string()
        }
    };
    transport.shutdown();
    if let Ok(mut outboxes) = shared.outboxes.lock() {
        outboxes.remove(&session);
    }
    let freed = shared
        .core
        .lock()
        .map(|mut core| core.disconnect(session))
        .unwrap_or_default();
    log::info!("session {} left ({}), released {} tiles", session, reason, freed);
    shared.emit(SessionEvent::ClientLeft {
        session_id: session,
        reason,
    });
}

enum Flow {
    Continue,
    Leave(String),
}

fn serve_connection(
    shared: &HostShared,
    session: SessionId,
    transport: &mut TcpFrameTransport,
) -> Result<String, NetworkError> {
    transport.set_read_timeout(Some(POLL_INTERVAL))?;
    let name = await_hello(shared, session, transport)?;

    let (outbox, snapshot) = {
        let store = shared.store.read().map_err(poisoned)?;
        let encoded_map = codec::encode_to_vec(&store)?;
        let digest = snapshot_digest(&encoded_map);
        log::debug!(
            "snapshot for session {}: revision {}, {} bytes, digest {}",
            session,
            store.revision(),
            encoded_map.len(),
            digest_text(&digest)
        );
        let (sender, receiver) = mpsc::channel();
        shared
            .outboxes
            .lock()
            .map_err(poisoned)?
            .insert(session, Outbox { sender, next_seq: 1 });
        let snapshot = Message::FullSnapshot {
            session_id: session,
            revision: store.revision(),
            digest,
            encoded_map,
        };
        (receiver, snapshot)
    };
    transport.send(&snapshot)?;
    log::info!("session {} joined as '{}'", session, name);
    shared.emit(SessionEvent::ClientJoined {
        session_id: session,
        name,
    });

    let mut last_seq = 0u64;
    let mut last_heard = Instant::now();
    let mut last_ping: Option<Instant> = None;
    while shared.control.is_running() {
        if let Some(reason) = flush_outbox(&outbox, transport)? {
            return Ok(reason);
        }
        match transport.read_frame()? {
            ReadOutcome::Frame(body) => {
                last_heard = Instant::now();
                let message = Message::decode(&body)?;
                if let Flow::Leave(reason) =
                    handle_message(shared, session, transport, &mut last_seq, message)?
                {
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
            ReadOutcome::Closed => return Err(NetworkError::lost("peer closed the connection")),
        }
    }
    flush_outbox(&outbox, transport)?;
    Ok("host closed the session".to_string())
}

fn await_hello(
    shared: &HostShared,
    session: SessionId,
    transport: &mut TcpFrameTransport,
) -> Result<String, NetworkError> {
    let started = Instant::now();
    while shared.control.is_running() {
        match transport.read_frame()? {
            ReadOutcome::Frame(body) => {
                return match Message::decode(&body)? {
                    Message::Hello {
                        protocol_version,
                        name,
                    } => {
                        let verdict = shared.core()?.hello(session, protocol_version, &name);
                        if let Err(err) = verdict {
                            transport.send(&Message::Goodbye {
                                reason: err.to_string(),
                            })?;
                            return Err(err);
                        }
                        Ok(name)
                    }
                    other => Err(CodecError::corrupt(format!(
                        "expected hello, got {}",
                        other.name()
                    ))
                    .into()),
                };
            }
            ReadOutcome::Timeout if started.elapsed() >= shared.config.timeout => {
                return Err(NetworkError::Timeout);
            }
            ReadOutcome::Timeout => {}
            ReadOutcome::Closed => return Err(NetworkError::lost("peer closed before hello")),
        }
    }
    Err(NetworkError::lost("host closed the session"))
}

/// Writes everything queued for this connection. Returns the reason when a
/// queued `Goodbye` ends it.
fn flush_outbox(
    outbox: &Receiver<Message>,
    transport: &mut TcpFrameTransport,
) -> Result<Option<String>, NetworkError> {
    loop {
        match outbox.try_recv() {
            Ok(message) => {
                transport.send(&message)?;
                if let Message::Goodbye { reason } = message {
                    return Ok(Some(reason));
                }
            }
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => return Ok(Some("outbox closed".to_string())),
        }
    }
}

fn handle_message(
    shared: &HostShared,
    session: SessionId,
    transport: &mut TcpFrameTransport,
    last_seq: &mut u64,
    message: Message,
) -> Result<Flow, NetworkError> {
    match message {
        Message::ChangeBatch(batch) => {
            if batch.seq <= *last_seq {
                log::debug!("session {} resent seq {}, dropped", session, batch.seq);
                return Ok(Flow::Continue);
            }
            if batch.seq != *last_seq + 1 {
                return Err(CodecError::corrupt(format!(
                    "sequence jumped from {} to {}",
                    last_seq, batch.seq
                ))
                .into());
            }
            *last_seq = batch.seq;
            submit(shared, session, batch)?;
        }
        Message::ResyncRequest { region } => {
            let store = shared.store.read().map_err(poisoned)?;
            let tiles = codec::encode_tiles(&store, region)?;
            shared.send_to(
                session,
                Message::RegionSnapshot {
                    revision: store.revision(),
                    region,
                    tiles,
                },
            )?;
        }
        Message::Ping => transport.send(&Message::Pong)?,
        Message::Pong => {}
        Message::Goodbye { reason } => return Ok(Flow::Leave(reason)),
        other => {
            return Err(CodecError::corrupt(format!(
                "unexpected {} from client",
                other.name()
            ))
            .into());
        }
    }
    Ok(Flow::Continue)
}

/// Admission runs on the connection thread; applying is left to the writer.
fn submit(shared: &HostShared, session: SessionId, message: BatchMessage) -> Result<(), NetworkError> {
    let store = shared.store.read().map_err(poisoned)?;
    let touched = store.touched_by(&message.batch);
    let verdict = shared.core()?.admit(session, &touched, message.base_revision);
    match verdict {
        Ok(()) => {
            drop(store);
            let batch_id = message.batch.id;
            let queued = shared
                .admissions
                .lock()
                .map_err(poisoned)?
                .send(Admitted {
                    session,
                    message,
                    touched: touched.clone(),
                });
            if queued.is_err() {
                shared.core()?.release(session, &touched);
                return Err(NetworkError::lost(format!(
                    "writer stopped before batch {}",
                    batch_id.0
                )));
            }
        }
        Err(conflict) => {
            log::info!(
                "batch {} from session {} rejected: {}",
                message.batch.id.0,
                session,
                conflict
            );
            shared.send_to(
                session,
                Message::Reject {
                    batch_id: message.batch.id,
                    reason: conflict,
                    region: Region::bounding(touched.iter().copied()),
                },
            )?;
        }
    }
    Ok(())
}
