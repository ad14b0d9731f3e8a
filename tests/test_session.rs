//! End-to-end session scenarios over the in-memory mesh: prediction, rollback,
//! desync recovery, host migration, batching and compression.


use bulwark_rollback::hash::{fnv1a, fnv1a_seeded, ENHANCED_BASIS};
use bulwark_rollback::network::messages::{
    HostReady, InputMessage, Message, MessageBody, MigrationAnnounce, MigrationReason,
    StateRequest, StateResponse, SyncTest,
};
use bulwark_rollback::{
    ChecksumTuple, Frame, OptimizerConfig, PlayerId, SessionBuilder, SessionConfig, SessionEvent,
    SessionState,
};
use stubs::{BigStateSim, CounterSim, Mesh};
use web_time::{Duration, Instant};

const A: PlayerId = PlayerId::new(0);
const B: PlayerId = PlayerId::new(1);
const C: PlayerId = PlayerId::new(2);

fn interval() -> Duration {
    Duration::from_nanos(1_000_000_000 / 60)
}

fn magic() -> u16 {
    SessionConfig::default().session_magic
}

fn input_msg(player: PlayerId, frame: i32, bytes: Vec<u8>, send_time: u128) -> Message {
    Message::new(
        magic(),
        MessageBody::Input(InputMessage {
            frame: Frame::new(frame),
            player,
            bytes,
            send_time,
        }),
    )
}

fn sync_tests_from(mailbox: &[(PlayerId, Message)]) -> Vec<SyncTest> {
    mailbox
        .iter()
        .filter_map(|(_, msg)| match &msg.body {
            MessageBody::SyncTest(sync) => Some(*sync),
            _ => None,
        })
        .collect()
}

/// Two live sessions exchanging constant inputs: late-arriving inputs equal the
/// prediction, so confirmation advances without a single rollback.
#[test]
fn prediction_correct_advances_without_rollback() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let ep_b = mesh.endpoint(B);
    let mut host = SessionBuilder::new()
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    let mut client = SessionBuilder::new()
        .join_as_client(B, A, Box::new(CounterSim::new()), Box::new(ep_b))
        .unwrap();
    host.add_player(B, false).unwrap();

    let start = Instant::now();
    let mut step = |host: &mut bulwark_rollback::Session,
                    client: &mut bulwark_rollback::Session,
                    index: u32| {
        let now = start + interval() * index;
        host.send_local_input(vec![1]).unwrap();
        client.send_local_input(vec![2]).unwrap();
        host.tick_at(now).unwrap();
        client.tick_at(now).unwrap();
    };

    // Warm up so both sides have observed each other's constant input.
    for index in 0..20 {
        step(&mut host, &mut client, index);
    }
    let rollbacks_before = host.metrics().rollback_count;
    let confirmed_before = host.metrics().confirmed_frame;

    // Deliveries towards the host lag for a few frames; it predicts.
    mesh.hold(A);
    for index in 20..24 {
        step(&mut host, &mut client, index);
    }
    mesh.release(A);
    for index in 24..30 {
        step(&mut host, &mut client, index);
    }

    let metrics = host.metrics();
    assert_eq!(
        metrics.rollback_count, rollbacks_before,
        "equal inputs must confirm predictions without rollback"
    );
    assert!(metrics.confirmed_frame > confirmed_before);
    assert!(metrics.prediction_count > 0);
    assert_eq!(metrics.desync_count, 0);
}

/// As above, but the remote changes its input while deliveries are held: exactly
/// one rollback repairs the misprediction and the peers stay in agreement.
#[test]
fn changed_input_triggers_single_rollback_and_reconverges() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let ep_b = mesh.endpoint(B);
    let mut host = SessionBuilder::new()
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    let mut client = SessionBuilder::new()
        .join_as_client(B, A, Box::new(CounterSim::new()), Box::new(ep_b))
        .unwrap();
    host.add_player(B, false).unwrap();

    let start = Instant::now();
    for index in 0..20 {
        let now = start + interval() * index;
        host.send_local_input(vec![1]).unwrap();
        client.send_local_input(vec![2]).unwrap();
        host.tick_at(now).unwrap();
        client.tick_at(now).unwrap();
    }
    assert_eq!(host.metrics().rollback_count, 0);

    // The client switches its input while the host cannot hear it.
    mesh.hold(A);
    for index in 20..24 {
        let now = start + interval() * index;
        host.send_local_input(vec![1]).unwrap();
        client.send_local_input(vec![9]).unwrap();
        host.tick_at(now).unwrap();
        client.tick_at(now).unwrap();
    }
    mesh.release(A);
    for index in 24..40 {
        let now = start + interval() * index;
        host.send_local_input(vec![1]).unwrap();
        client.send_local_input(vec![9]).unwrap();
        host.tick_at(now).unwrap();
        client.tick_at(now).unwrap();
    }

    let metrics = host.metrics();
    assert_eq!(metrics.rollback_count, 1, "one correction, one rollback");
    assert!(metrics.avg_rollback_depth >= 1.0);
    assert_eq!(
        metrics.desync_count, 0,
        "states must agree again after the replay"
    );
    let events = host.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RollbackCompleted { .. })));
}

/// A three-player desync where the local peer is outvoted: rollback-to-agreement
/// reproduces the divergence, so the ladder climbs to a targeted state resync,
/// which repairs the session.
#[test]
fn outvoted_desync_recovers_via_targeted_resync() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let b_mailbox = mesh.endpoint(B);
    let _c_mailbox = mesh.endpoint(C);
    let mut session = SessionBuilder::new()
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    session.add_player(B, false).unwrap();
    session.add_player(C, false).unwrap();

    let start = Instant::now();
    let mut b_seen: Vec<(PlayerId, Message)> = Vec::new();
    let mut drive = |session: &mut bulwark_rollback::Session,
                     b_mailbox: &mut stubs::MeshEndpoint,
                     b_seen: &mut Vec<(PlayerId, Message)>,
                     index: u32| {
        session.send_local_input(vec![1]).unwrap();
        session
            .tick_at(start + interval() * index)
            .unwrap();
        b_seen.extend(bulwark_rollback::Transport::receive_all_messages(b_mailbox));
    };

    let mut b_mailbox = b_mailbox;
    for index in 0..7 {
        drive(&mut session, &mut b_mailbox, &mut b_seen, index);
    }
    let ours = sync_tests_from(&b_seen);
    let tuple_at = |frame: i32| -> ChecksumTuple {
        ours.iter()
            .find(|s| s.frame == Frame::new(frame))
            .map(|s| s.checksums)
            .expect("sync test for frame")
    };

    // B and C corroborate us for frames 3 and 4, but both report a different
    // version of frame 5: we are the minority.
    let forged = ChecksumTuple {
        basic: 0xBAD0_BAD0,
        enhanced: 0xBAD1_BAD1,
        deep: None,
        native: None,
    };
    for peer in [B, C] {
        for frame in [3, 4] {
            mesh.inject(
                peer,
                A,
                Message::new(
                    magic(),
                    MessageBody::SyncTest(SyncTest {
                        frame: Frame::new(frame),
                        checksums: tuple_at(frame),
                        send_time: 1_000_000,
                    }),
                ),
            );
        }
        mesh.inject(
            peer,
            A,
            Message::new(
                magic(),
                MessageBody::SyncTest(SyncTest {
                    frame: Frame::new(5),
                    checksums: forged,
                    send_time: 1_000_000,
                }),
            ),
        );
    }

    drive(&mut session, &mut b_mailbox, &mut b_seen, 7);

    // The rollback rung ran and failed to change anything, so a state request
    // went to the lowest-id majority peer.
    assert!(session.metrics().rollback_count >= 1);
    assert_eq!(session.metrics().desync_count, 1);
    let request = b_seen
        .iter()
        .find_map(|(_, msg)| match &msg.body {
            MessageBody::StateRequest(request) => Some(*request),
            _ => None,
        })
        .expect("targeted state request to B");
    assert_eq!(request.frame, Frame::new(5));

    // B supplies its (checksummed) truth for frame 5.
    let their_state: Vec<u8> = [5u32.to_le_bytes(), 99u32.to_le_bytes()].concat();
    let their_checksums = ChecksumTuple {
        basic: fnv1a(&their_state),
        enhanced: fnv1a_seeded(&their_state, ENHANCED_BASIS),
        deep: None,
        native: None,
    };
    mesh.inject(
        B,
        A,
        Message::new(
            magic(),
            MessageBody::StateResponse(StateResponse {
                request_id: request.request_id,
                frame: Frame::new(5),
                state: Some(their_state),
                checksums: Some(their_checksums),
            }),
        ),
    );
    drive(&mut session, &mut b_mailbox, &mut b_seen, 8);

    let status = session.status();
    assert_eq!(status.stats.recoveries, 1);
    assert!((session.metrics().recovery_success_rate - 0.5).abs() < 1e-9);
    let events = session.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::DesyncRecovered { .. })));

    // And the session keeps running afterwards.
    session.send_local_input(vec![1]).unwrap();
    session.tick_at(start + interval() * 9).unwrap();
    assert_eq!(session.state(), SessionState::Running);
}

/// The host vanishes; the only remaining peer elects itself, adopts its own
/// state and the session resumes under the new authority.
#[test]
fn host_departure_migrates_to_best_survivor() {
    let mesh = Mesh::new();
    let host_id = PlayerId::new(7);
    let ep_host = mesh.endpoint(host_id);
    let ep_a = mesh.endpoint(A);
    let mut host = SessionBuilder::new()
        .start_as_host(host_id, Box::new(CounterSim::new()), Box::new(ep_host))
        .unwrap();
    let mut survivor = SessionBuilder::new()
        .join_as_client(A, host_id, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    host.add_player(A, false).unwrap();

    let start = Instant::now();
    for index in 0..10 {
        let now = start + interval() * index;
        host.send_local_input(vec![1]).unwrap();
        survivor.send_local_input(vec![2]).unwrap();
        host.tick_at(now).unwrap();
        survivor.tick_at(now).unwrap();
    }
    assert_eq!(survivor.host(), Some(host_id));

    // The host's process dies; the transport notices.
    mesh.disconnect(host_id);
    survivor.tick_at(start + interval() * 11).unwrap();

    let status = survivor.status();
    assert_eq!(survivor.host(), Some(A), "survivor adopted authority");
    assert_eq!(status.players.iter().filter(|p| p.is_host).count(), 1);
    assert!(!status.players.iter().any(|p| p.id == host_id));
    assert_eq!(status.stats.host_migrations, 1);
    assert!((survivor.metrics().migration_success_rate - 1.0).abs() < 1e-9);
    assert_eq!(survivor.state(), SessionState::Running);

    let events = survivor.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::MigrationStarted { new_host } if *new_host == A)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::MigrationCompleted { new_host, .. } if *new_host == A)));

    // The session keeps simulating after the cutover.
    let before = survivor.metrics().current_frame;
    survivor.send_local_input(vec![2]).unwrap();
    survivor.tick_at(start + interval() * 12).unwrap();
    assert!(survivor.metrics().current_frame > before);
}

/// A degraded link switches outgoing inputs from immediate sends to batches.
#[test]
fn degraded_link_batches_outgoing_inputs() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let b_mailbox = mesh.endpoint(B);
    let config = SessionConfig {
        optimizer: OptimizerConfig {
            // Slower flush than the frame cadence so batches can accumulate.
            max_batch_ms: 100,
            ..OptimizerConfig::default()
        },
        ..SessionConfig::default()
    };
    let mut session = SessionBuilder::new()
        .with_config(config)
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    session.add_player(B, false).unwrap();

    let start = Instant::now();
    session.tick_at(start).unwrap();

    // Answer the first ping very slowly: the measured round trip tanks the grade.
    let mut b_mailbox = b_mailbox;
    let ping = bulwark_rollback::Transport::receive_all_messages(&mut b_mailbox)
        .into_iter()
        .find_map(|(_, msg)| match msg.body {
            MessageBody::Ping(ping) => Some(ping),
            _ => None,
        })
        .expect("host pings the new peer");
    mesh.inject(
        B,
        A,
        Message::new(
            magic(),
            MessageBody::Pong(bulwark_rollback::diagnostics::NetworkDiagnostics::answer_ping(
                &ping, ping.t0,
            )),
        ),
    );
    session.tick_at(start + Duration::from_millis(400)).unwrap();

    let events = session.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::QualityChanged { .. })));

    // Several frames of input accumulate into one packet.
    for index in 0..12u32 {
        session.send_local_input(vec![index as u8]).unwrap();
        session
            .tick_at(start + Duration::from_millis(400) + interval() * (index + 1))
            .unwrap();
    }

    let outbound = bulwark_rollback::Transport::receive_all_messages(&mut b_mailbox);
    let best_batch = outbound
        .iter()
        .filter_map(|(_, msg)| match &msg.body {
            MessageBody::InputBatch(batch) => Some(batch.entries.len()),
            _ => None,
        })
        .max()
        .expect("batched input packets under a degraded grade");
    assert!(best_batch >= 2, "batch carried {best_batch} entries");
    assert!(session.metrics().avg_batch_size > 1.0);
}

/// Large, slowly changing states are stored as deltas: the stored-over-raw byte
/// ratio drops well below one.
#[test]
fn large_states_compress_in_the_snapshot_ring() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let mut session = SessionBuilder::new()
        .start_as_host(A, Box::new(BigStateSim::new(4096)), Box::new(ep_a))
        .unwrap();

    let start = Instant::now();
    for index in 0..10 {
        session.send_local_input(vec![1]).unwrap();
        session.tick_at(start + interval() * index).unwrap();
    }

    let ratio = session.metrics().compression_ratio;
    assert!(ratio < 0.5, "compression ratio {ratio} should be well below 1");
}

/// With a silent remote peer the engine stalls at the prediction bound, then
/// resumes with exactly one rollback once the real (different) inputs arrive.
#[test]
fn prediction_overflow_stalls_then_resumes_with_one_rollback() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let _b_mailbox = mesh.endpoint(B);
    let mut session = SessionBuilder::new()
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    session.add_player(B, false).unwrap();

    let start = Instant::now();
    for index in 0..20 {
        session.send_local_input(vec![1]).unwrap();
        session.tick_at(start + interval() * index).unwrap();
    }
    let stalled_at = session.metrics().current_frame;
    let events = session.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Stalled { .. })));

    // The whole backlog arrives at once, contradicting the blank predictions.
    for frame in 2..=stalled_at.as_i32() {
        mesh.inject(B, A, input_msg(B, frame, vec![7], u128::from(frame as u32)));
    }
    for index in 20..24 {
        session.send_local_input(vec![1]).unwrap();
        session.tick_at(start + interval() * index).unwrap();
    }

    let metrics = session.metrics();
    assert_eq!(metrics.rollback_count, 1);
    assert!(metrics.current_frame > stalled_at);
    assert_eq!(session.state(), SessionState::Running);
}

/// Desync handling freezes while a migration is in flight on the same tick.
#[test]
fn migration_freezes_desync_handling() {
    let mesh = Mesh::new();
    let host_id = PlayerId::new(7);
    let ep_a = mesh.endpoint(A);
    let mut session = SessionBuilder::new()
        .join_as_client(A, host_id, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    session.add_player(C, false).unwrap();

    let start = Instant::now();
    for index in 0..5 {
        session.send_local_input(vec![1]).unwrap();
        session.tick_at(start + interval() * index).unwrap();
    }

    // Same tick: a migration announcement and hostile checksums.
    mesh.inject(
        C,
        A,
        Message::new(
            magic(),
            MessageBody::MigrationAnnounce(MigrationAnnounce {
                new_host: C,
                reason: MigrationReason::HostTimeout,
                frame: Frame::new(4),
            }),
        ),
    );
    for frame in [2, 3] {
        mesh.inject(
            C,
            A,
            Message::new(
                magic(),
                MessageBody::SyncTest(SyncTest {
                    frame: Frame::new(frame),
                    checksums: ChecksumTuple {
                        basic: 0xDEAD,
                        enhanced: 0xDEAD,
                        deep: None,
                        native: None,
                    },
                    send_time: 999,
                }),
            ),
        );
    }
    session.tick_at(start + interval() * 5).unwrap();
    assert_eq!(session.state(), SessionState::Migrating);
    assert_eq!(
        session.metrics().desync_count,
        0,
        "desync evaluation must not run mid-migration"
    );

    mesh.inject(
        C,
        A,
        Message::new(
            magic(),
            MessageBody::HostReady(HostReady {
                host: C,
                frame: Frame::new(4),
            }),
        ),
    );
    session.tick_at(start + interval() * 6).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.host(), Some(C));
}

/// A state request from a peer is answered with a checksummed state.
#[test]
fn peers_answer_state_requests() {
    let mesh = Mesh::new();
    let ep_a = mesh.endpoint(A);
    let b_mailbox = mesh.endpoint(B);
    let mut session = SessionBuilder::new()
        .start_as_host(A, Box::new(CounterSim::new()), Box::new(ep_a))
        .unwrap();
    session.add_player(B, false).unwrap();

    let start = Instant::now();
    for index in 0..4 {
        session.send_local_input(vec![1]).unwrap();
        session.tick_at(start + interval() * index).unwrap();
    }

    mesh.inject(
        B,
        A,
        Message::new(
            magic(),
            MessageBody::StateRequest(StateRequest {
                request_id: 55,
                frame: Frame::NULL,
            }),
        ),
    );
    session.tick_at(start + interval() * 4).unwrap();

    let mut b_mailbox = b_mailbox;
    let response = bulwark_rollback::Transport::receive_all_messages(&mut b_mailbox)
        .into_iter()
        .find_map(|(_, msg)| match msg.body {
            MessageBody::StateResponse(response) => Some(response),
            _ => None,
        })
        .expect("state response");
    assert_eq!(response.request_id, 55);
    assert!(response.state.is_some());
    assert!(response.checksums.is_some());
    assert!(response.frame.is_valid());
}
