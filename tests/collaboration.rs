use mapedit::edit::change::{BatchId, Change, ChangeBatch};
use mapedit::entities::item::Item;
use mapedit::net::protocol::{Message, PROTOCOL_VERSION};
use mapedit::net::transport::{FrameTransport, TcpFrameTransport, DEFAULT_MAX_FRAME};
use mapedit::session::{ClientState, SessionConfig, SessionEvent, SessionId};
use mapedit::world::position::Position;
use mapedit::world::tile::Tile;
use mapedit::{ConflictError, EditOutcome, Editor, EditorOptions};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_secs(10);

fn host_with_map() -> (Editor, u16) {
    host_with_options(EditorOptions::default())
}

fn host_with_options(options: EditorOptions) -> (Editor, u16) {
    let mut host = Editor::new(options);
    host.new_map(256, 256).expect("new map");
    let seed = ChangeBatch::new(vec![
        Change::ReplaceTile {
            position: Position::new(20, 20, 7),
            tile: Some(Tile::new(Position::new(20, 20, 7)).with_ground(Item::new(4526))),
        },
        Change::SetWaypoint {
            name: "Temple".to_string(),
            position: Some(Position::new(20, 20, 7)),
        },
    ]);
    host.apply_local_edit(seed).expect("seed");
    let addr = host.host_session(0).expect("host");
    (host, addr.port())
}

fn join(port: u16) -> Editor {
    join_with_options(port, EditorOptions::default())
}

fn join_with_options(port: u16, options: EditorOptions) -> Editor {
    let mut client = Editor::new(options);
    client.join_session("127.0.0.1", port).expect("join");
    client
}

fn quick_liveness() -> EditorOptions {
    EditorOptions {
        session: SessionConfig {
            ping_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(400),
            ..SessionConfig::default()
        },
        ..EditorOptions::default()
    }
}

/// A bare connection that says hello under `name` and then does only what
/// the test tells it to.
fn raw_peer(port: u16, name: &str) -> TcpFrameTransport {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut transport =
        TcpFrameTransport::connect(addr, Duration::from_secs(2), DEFAULT_MAX_FRAME).expect("connect");
    transport
        .send(&Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
        })
        .expect("hello");
    transport
}

fn joined_as(events: &[SessionEvent], name: &str) -> Option<SessionId> {
    events.iter().find_map(|event| match event {
        SessionEvent::ClientJoined {
            session_id,
            name: joined,
        } if joined == name => Some(*session_id),
        _ => None,
    })
}

fn left_reason(events: &[SessionEvent], session: SessionId) -> Option<String> {
    events.iter().find_map(|event| match event {
        SessionEvent::ClientLeft { session_id, reason } if *session_id == session => {
            Some(reason.clone())
        }
        _ => None,
    })
}

fn live_id(editor: &Editor) -> SessionId {
    match editor.client_state() {
        Some(ClientState::Live { session_id }) => session_id,
        other => panic!("client is not live: {:?}", other),
    }
}

/// Polls every editor until `done` holds or the deadline passes, collecting
/// events per editor.
fn settle<F>(editors: &mut [&mut Editor], events: &mut [Vec<SessionEvent>], mut done: F) -> bool
where
    F: FnMut(&[&mut Editor], &[Vec<SessionEvent>]) -> bool,
{
    let deadline = Instant::now() + SETTLE;
    loop {
        for (editor, seen) in editors.iter_mut().zip(events.iter_mut()) {
            seen.extend(editor.poll());
        }
        if done(editors, events) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn ground_at(editor: &Editor, position: Position) -> Option<u16> {
    let store = editor.read().expect("read");
    store
        .tile(position)
        .and_then(|tile| tile.ground.as_ref())
        .map(|ground| ground.type_id.0)
}

fn items_at(editor: &Editor, position: Position) -> Vec<u16> {
    let store = editor.read().expect("read");
    store
        .tile(position)
        .map(|tile| tile.items.iter().map(|item| item.type_id.0).collect())
        .unwrap_or_default()
}

#[test]
fn joining_client_receives_the_host_map() {
    let (mut host, port) = host_with_map();
    let mut client = join(port);

    assert!(matches!(client.client_state(), Some(ClientState::Live { .. })));
    assert_eq!(*client.read().expect("client"), *host.read().expect("host"));
    assert_eq!(client.role_name(), "client");

    let mut events = vec![Vec::new(), Vec::new()];
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        events[0]
            .iter()
            .any(|event| matches!(event, SessionEvent::ClientJoined { .. }))
    }));
}

#[test]
fn client_edit_reaches_every_replica_once() {
    let (mut host, port) = host_with_map();
    let mut first = join(port);
    let mut second = join(port);
    let target = Position::new(5, 5, 7);

    let outcome = first
        .apply_local_edit(ChangeBatch::single(Change::AddItem {
            position: target,
            index: None,
            item: Item::new(1987),
        }))
        .expect("submit");
    let EditOutcome::Submitted(batch_id) = outcome else {
        panic!("client edits wait for the host");
    };

    let mut events = vec![Vec::new(), Vec::new(), Vec::new()];
    let converged = settle(
        &mut [&mut host, &mut first, &mut second],
        &mut events,
        |editors, events| {
            let acked = events[1].iter().any(
                |event| matches!(event, SessionEvent::LocalApplied(applied) if applied.id == batch_id),
            );
            acked && editors.iter().all(|editor| items_at(editor, target) == vec![1987])
        },
    );
    assert!(converged, "edit did not reach every replica");

    assert!(events[2].iter().any(|event| matches!(
        event,
        SessionEvent::RemoteApplied { applied, .. } if applied.id == batch_id
    )));
    assert_eq!(*first.read().expect("first"), *host.read().expect("host"));
    assert_eq!(*second.read().expect("second"), *host.read().expect("host"));
    assert_eq!(first.ledger().len(), 1);
    assert!(first.ledger().can_undo());
}

#[test]
fn host_edit_and_undo_reach_clients() {
    let (mut host, port) = host_with_map();
    let mut client = join(port);
    let target = Position::new(30, 30, 7);

    let outcome = host
        .apply_local_edit(ChangeBatch::single(Change::SetGround {
            position: target,
            ground: Some(Item::new(103)),
        }))
        .expect("host edit");
    assert!(matches!(outcome, EditOutcome::Applied(_)));

    let mut events = vec![Vec::new(), Vec::new()];
    assert!(settle(&mut [&mut host, &mut client], &mut events, |editors, _| {
        ground_at(&*editors[1], target) == Some(103)
    }));

    host.undo().expect("undo").expect("something to undo");
    assert_eq!(ground_at(&host, target), None);
    assert!(settle(&mut [&mut host, &mut client], &mut events, |editors, _| {
        ground_at(&*editors[1], target).is_none()
    }));
    assert_eq!(*client.read().expect("client"), *host.read().expect("host"));
}

#[test]
fn concurrent_edits_on_one_tile_admit_exactly_one() {
    let (mut host, port) = host_with_map();
    let mut first = join(port);
    let mut second = join(port);
    let contested = Position::new(1, 1, 7);

    let submit = |editor: &mut Editor, type_id: u16| {
        match editor
            .apply_local_edit(ChangeBatch::single(Change::SetGround {
                position: contested,
                ground: Some(Item::new(type_id)),
            }))
            .expect("submit")
        {
            EditOutcome::Submitted(id) => id,
            EditOutcome::Applied(_) => panic!("client edits wait for the host"),
        }
    };
    let first_id = submit(&mut first, 100);
    let second_id = submit(&mut second, 200);

    let resolved = |events: &[SessionEvent], id: BatchId| {
        events.iter().any(|event| match event {
            SessionEvent::LocalApplied(applied) => applied.id == id,
            SessionEvent::Rejected { batch_id, .. } => *batch_id == id,
            _ => false,
        })
    };
    let mut events = vec![Vec::new(), Vec::new(), Vec::new()];
    assert!(settle(
        &mut [&mut host, &mut first, &mut second],
        &mut events,
        |_, events| resolved(events[1].as_slice(), first_id) && resolved(events[2].as_slice(), second_id),
    ));

    let rejection = |events: &[SessionEvent]| {
        events.iter().find_map(|event| match event {
            SessionEvent::Rejected { conflict, .. } => Some(conflict.clone()),
            _ => None,
        })
    };
    let rejections = [rejection(events[1].as_slice()), rejection(events[2].as_slice())];
    assert_eq!(
        rejections.iter().filter(|conflict| conflict.is_some()).count(),
        1,
        "exactly one of the two batches is admitted"
    );
    let (winner_ground, loser) = if rejections[0].is_some() { (200, 1) } else { (100, 2) };
    let conflict = rejections[loser - 1].clone().expect("loser conflict");
    assert!(matches!(
        conflict,
        ConflictError::TileLocked { .. } | ConflictError::StaleVersion { .. }
    ));
    assert_eq!(conflict.position(), Some(contested));

    assert!(settle(
        &mut [&mut host, &mut first, &mut second],
        &mut events,
        |editors, events| {
            events[loser]
                .iter()
                .any(|event| matches!(event, SessionEvent::Resynced { .. }))
                && editors
                    .iter()
                    .all(|editor| ground_at(editor, contested) == Some(winner_ground))
        },
    ));
    assert_eq!(*first.read().expect("first"), *host.read().expect("host"));
    assert_eq!(*second.read().expect("second"), *host.read().expect("host"));
}

#[test]
fn closed_host_disconnects_clients() {
    let (mut host, port) = host_with_map();
    let mut client = join(port);

    host.close_session();
    host.close_session();
    assert_eq!(host.role_name(), "standalone");

    let mut events = vec![Vec::new()];
    assert!(settle(&mut [&mut client], &mut events, |editors, _| {
        matches!((*editors[0]).client_state(), Some(ClientState::Disconnected { .. }))
    }));
    let err = client
        .apply_local_edit(ChangeBatch::single(Change::SetGround {
            position: Position::new(2, 2, 7),
            ground: Some(Item::new(100)),
        }))
        .unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[test]
fn malformed_frame_drops_only_its_connection() {
    let (mut host, port) = host_with_map();
    let mut client = join(port);
    let mut rogue = raw_peer(port, "rogue");

    let mut events = vec![Vec::new(), Vec::new()];
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        joined_as(events[0].as_slice(), "rogue").is_some()
    }));
    let rogue_id = joined_as(events[0].as_slice(), "rogue").expect("rogue joined");

    rogue.write_frame(&[0x7f, 1, 2, 3]).expect("write garbage");
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        left_reason(events[0].as_slice(), rogue_id).is_some()
    }));
    let reason = left_reason(events[0].as_slice(), rogue_id).expect("rogue left");
    assert!(reason.contains("malformed"), "unexpected reason: {}", reason);

    let client_id = live_id(&client);
    assert!(left_reason(events[0].as_slice(), client_id).is_none());
    let target = Position::new(8, 8, 7);
    client
        .apply_local_edit(ChangeBatch::single(Change::SetGround {
            position: target,
            ground: Some(Item::new(4526)),
        }))
        .expect("submit after the rogue left");
    assert!(settle(&mut [&mut host, &mut client], &mut events, |editors, _| {
        editors.iter().all(|editor| ground_at(editor, target) == Some(4526))
    }));
    assert_eq!(live_id(&client), client_id);
    assert_eq!(*client.read().expect("client"), *host.read().expect("host"));
}

#[test]
fn reconnect_resyncs_a_diverged_client() {
    let (mut host, port) = host_with_map();
    let mut client = join(port);
    let first_id = live_id(&client);

    client
        .store()
        .write()
        .expect("client store")
        .apply(&ChangeBatch::single(Change::SetGround {
            position: Position::new(20, 20, 7),
            ground: None,
        }))
        .expect("local divergence");
    assert_ne!(*client.read().expect("client"), *host.read().expect("host"));

    host.apply_local_edit(ChangeBatch::single(Change::AddItem {
        position: Position::new(20, 20, 7),
        index: None,
        item: Item::new(1987),
    }))
    .expect("host edit");

    let mut events = vec![Vec::new(), Vec::new()];
    client.reconnect().expect("reconnect");
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        events[1]
            .iter()
            .any(|event| matches!(event, SessionEvent::StateChanged(ClientState::Live { .. })))
    }));

    let syncing = events[1]
        .iter()
        .position(|event| matches!(event, SessionEvent::StateChanged(ClientState::Syncing)))
        .expect("passed through syncing");
    let live = events[1]
        .iter()
        .rposition(|event| matches!(event, SessionEvent::StateChanged(ClientState::Live { .. })))
        .expect("live again");
    assert!(syncing < live);

    let second_id = live_id(&client);
    assert_ne!(second_id, first_id);
    assert_eq!(items_at(&client, Position::new(20, 20, 7)), vec![1987]);
    assert_eq!(*client.read().expect("client"), *host.read().expect("host"));
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        left_reason(events[0].as_slice(), first_id).is_some()
    }));
}

#[test]
fn silent_peer_is_dropped_while_a_responsive_one_stays() {
    let (mut host, port) = host_with_options(quick_liveness());
    let mut client = join_with_options(port, quick_liveness());
    let client_id = live_id(&client);
    let _silent = raw_peer(port, "silent");

    let mut events = vec![Vec::new(), Vec::new()];
    assert!(settle(&mut [&mut host, &mut client], &mut events, |_, events| {
        joined_as(events[0].as_slice(), "silent")
            .and_then(|id| left_reason(events[0].as_slice(), id))
            .is_some()
    }));
    let silent_id = joined_as(events[0].as_slice(), "silent").expect("silent joined");
    let reason = left_reason(events[0].as_slice(), silent_id).expect("silent left");
    assert!(reason.contains("timed out"), "unexpected reason: {}", reason);

    std::thread::sleep(Duration::from_millis(600));
    events[0].extend(host.poll());
    events[1].extend(client.poll());
    assert!(left_reason(events[0].as_slice(), client_id).is_none());
    assert_eq!(live_id(&client), client_id);
}

#[test]
fn joining_a_closed_port_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let mut client = Editor::new(EditorOptions::default());
    assert!(client.join_session("127.0.0.1", port).is_err());
    assert_eq!(client.role_name(), "standalone");
}
