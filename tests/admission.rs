use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use veilstream::admission::{Acceptor, AdmissionConfig, AdmissionQueue};
use veilstream::manager::{Connection, ConnectionManager, PacketCodec};
use veilstream::packet::{
    Identity, Packet, FLAG_RESET, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE,
};
use veilstream::timer::{MonotonicTime, TimerService};

struct TestManager {
    local: Identity,
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    outbound: Mutex<Vec<Packet>>,
    redispatched: Mutex<Vec<Packet>>,
}

impl TestManager {
    fn new() -> Self {
        Self {
            local: Identity::from_bytes([0xEE; 32]),
            connections: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Vec::new()),
            redispatched: Mutex::new(Vec::new()),
        }
    }

    fn resets(&self) -> Vec<Packet> {
        self.outbound
            .lock()
            .iter()
            .filter(|p| p.is_flag_set(FLAG_RESET))
            .cloned()
            .collect()
    }

    fn redispatched_count(&self) -> usize {
        self.redispatched.lock().len()
    }
}

impl ConnectionManager for TestManager {
    fn receive_connection(&self, mut syn: Packet) -> Result<Arc<Connection>, Packet> {
        let Some(from) = syn.optional_from else {
            return Err(syn);
        };
        syn.release_payload();
        let connection = Arc::new(Connection::new(
            from,
            syn.send_stream_id,
            syn.receive_stream_id,
            0,
        ));
        self.connections
            .lock()
            .insert(syn.receive_stream_id, Arc::clone(&connection));
        Ok(connection)
    }

    fn connection_by_outbound_id(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    fn receive_packet_direct(&self, packet: Packet) {
        self.redispatched.lock().push(packet);
    }

    fn enqueue_outbound(&self, packet: Packet) {
        self.outbound.lock().push(packet);
    }

    fn local_identity(&self) -> Identity {
        self.local
    }
}

struct TestCodec;

impl PacketCodec for TestCodec {
    fn verify_signature(&self, packet: &Packet, claimed_sender: &Identity) -> bool {
        packet.is_flag_set(FLAG_SIGNATURE_INCLUDED)
            && packet.signature.as_deref() == Some(claimed_sender.as_bytes().as_slice())
    }
}

struct Fixture {
    handler: AdmissionQueue,
    acceptor: Acceptor,
    manager: Arc<TestManager>,
    timer: Arc<TimerService>,
}

fn setup(config: AdmissionConfig) -> Fixture {
    let timer = Arc::new(TimerService::spawn(Arc::new(MonotonicTime::new())));
    let manager = Arc::new(TestManager::new());
    let (handler, acceptor) = AdmissionQueue::with_config(
        Arc::clone(&timer),
        manager.clone(),
        Arc::new(TestCodec),
        config,
    );
    Fixture {
        handler,
        acceptor,
        manager,
        timer,
    }
}

fn identity(tag: u8) -> Identity {
    Identity::from_bytes([tag; 32])
}

fn signed_syn(tag: u8, receive_stream_id: u32, seq: u32) -> Packet {
    let from = identity(tag);
    let mut packet = Packet::new(FLAG_SYNCHRONIZE | FLAG_SIGNATURE_INCLUDED);
    packet.optional_from = Some(from);
    packet.send_stream_id = 1_000 + receive_stream_id;
    packet.receive_stream_id = receive_stream_id;
    packet.sequence_number = seq;
    packet.signature = Some(from.as_bytes().to_vec());
    packet.with_payload(vec![0xAB; 16])
}

fn non_syn(receive_stream_id: u32) -> Packet {
    let mut packet = Packet::new(0);
    packet.send_stream_id = 0;
    packet.receive_stream_id = receive_stream_id;
    packet.with_payload(vec![0xCD; 16])
}

#[test]
fn backlog_is_bounded_and_overflow_gets_reset() {
    let fix = setup(AdmissionConfig {
        accept_timeout_ms: 60_000,
        ..AdmissionConfig::default()
    });
    fix.handler.set_active(true);

    for i in 1..=100u32 {
        fix.handler.receive_new_syn(signed_syn((i % 251) as u8, i, i));
    }

    assert_eq!(fix.handler.depth(), 64);
    assert_eq!(*fix.handler.metrics().queued_total.lock(), 64);
    assert_eq!(*fix.handler.metrics().drops_full.lock(), 36);
    assert_eq!(fix.manager.resets().len(), 36);
    fix.timer.shutdown();
}

#[test]
fn accept_returns_connections_in_fifo_order() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(1, 7, 1));
    fix.handler.receive_new_syn(signed_syn(2, 8, 1));

    let first = fix.acceptor.accept(1_000).expect("first connection");
    let second = fix.acceptor.accept(1_000).expect("second connection");
    assert_eq!(first.receive_stream_id(), 7);
    assert_eq!(second.receive_stream_id(), 8);
    assert_eq!(*fix.handler.metrics().accepts_total.lock(), 2);
}

#[test]
fn duplicate_syn_is_suppressed_without_reset() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 1));
    let connection = fix.acceptor.accept(1_000).expect("connection from SYN");
    assert_eq!(connection.remote_peer(), identity(0xA1));

    // retransmitted SYN from the same peer with the same stream id
    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 2));
    assert!(fix.acceptor.accept(500).is_none());
    assert_eq!(*fix.handler.metrics().drops_duplicate.lock(), 1);
    assert!(fix.manager.resets().is_empty());
}

#[test]
fn same_stream_id_from_other_peer_is_not_a_duplicate() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 1));
    fix.acceptor.accept(1_000).expect("first connection");

    // the id collides but the identity differs, so it must be admitted
    fix.handler.receive_new_syn(signed_syn(0xB2, 7, 1));
    let second = fix.acceptor.accept(1_000).expect("second connection");
    assert_eq!(second.remote_peer(), identity(0xB2));
}

#[test]
fn queued_syn_times_out_into_reset() {
    let fix = setup(AdmissionConfig {
        accept_timeout_ms: 100,
        ..AdmissionConfig::default()
    });
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 42));
    thread::sleep(Duration::from_millis(400));

    let resets = fix.manager.resets();
    assert_eq!(resets.len(), 1);
    let reset = &resets[0];
    assert!(reset.is_flag_set(FLAG_RESET));
    assert!(reset.is_flag_set(FLAG_SIGNATURE_INCLUDED));
    assert_eq!(reset.ack_through, 42);
    assert_eq!(reset.send_stream_id, 7);
    assert_eq!(reset.receive_stream_id, 0);
    assert_eq!(reset.to, Some(identity(0xA1)));
    assert_eq!(reset.optional_from, Some(fix.manager.local_identity()));

    assert_eq!(*fix.handler.metrics().timeouts_total.lock(), 1);
    assert_eq!(fix.handler.depth(), 0);
    fix.timer.shutdown();
}

#[test]
fn shutdown_drains_backlog_with_resets() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(1, 1, 1));
    fix.handler.receive_new_syn(signed_syn(2, 2, 1));
    fix.handler.receive_new_syn(signed_syn(3, 3, 1));

    fix.handler.set_active(false);
    assert!(fix.acceptor.accept(-1).is_none());
    assert_eq!(fix.manager.resets().len(), 3);
    assert_eq!(fix.handler.depth(), 0);
}

#[test]
fn poison_wakes_indefinitely_blocked_accept() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    let handler = fix.handler.clone();
    let consumer = thread::spawn(move || fix.acceptor.accept(0));

    thread::sleep(Duration::from_millis(100));
    handler.set_active(false);
    assert!(consumer.join().expect("consumer thread").is_none());
}

#[test]
fn inactive_producer_resets_syn_and_drops_others() {
    let fix = setup(AdmissionConfig::default());

    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 1));
    assert_eq!(*fix.handler.metrics().drops_inactive.lock(), 1);
    assert_eq!(fix.manager.resets().len(), 1);

    // non-SYN drop never answers with a reset
    fix.handler.receive_new_syn(non_syn(7));
    assert_eq!(*fix.handler.metrics().drops_inactive.lock(), 2);
    assert_eq!(fix.manager.resets().len(), 1);
}

#[test]
fn spoofed_syn_is_never_answered() {
    let fix = setup(AdmissionConfig::default());

    let mut forged = signed_syn(0xA1, 7, 1);
    forged.signature = Some(vec![0u8; 32]);
    fix.handler.receive_new_syn(forged);

    assert!(fix.manager.resets().is_empty());
    assert_eq!(*fix.handler.metrics().drops_bad_signature.lock(), 1);
}

#[test]
fn syn_without_sender_is_dropped_silently() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    let mut anonymous = signed_syn(0xA1, 7, 1);
    anonymous.optional_from = None;
    fix.handler.receive_new_syn(anonymous);

    assert!(fix.acceptor.accept(300).is_none());
    assert_eq!(*fix.handler.metrics().drops_no_from.lock(), 1);
    assert!(fix.manager.resets().is_empty());
}

#[test]
fn stranded_non_syn_is_redispatched_to_its_connection() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(signed_syn(0xA1, 7, 1));
    fix.acceptor.accept(1_000).expect("connection");

    fix.handler.receive_new_syn(non_syn(7));
    assert!(fix.acceptor.accept(300).is_none());
    assert_eq!(fix.manager.redispatched_count(), 1);
}

#[test]
fn stranded_non_syn_without_home_times_out_silently() {
    let fix = setup(AdmissionConfig {
        accept_timeout_ms: 100,
        ..AdmissionConfig::default()
    });
    fix.handler.set_active(true);

    fix.handler.receive_new_syn(non_syn(9));
    thread::sleep(Duration::from_millis(400));

    assert!(fix.manager.resets().is_empty());
    assert_eq!(fix.manager.redispatched_count(), 0);
    assert_eq!(*fix.handler.metrics().timeouts_total.lock(), 1);
    fix.timer.shutdown();
}

#[test]
fn accept_observes_its_deadline() {
    let mut fix = setup(AdmissionConfig::default());
    fix.handler.set_active(true);

    let started = Instant::now();
    assert!(fix.acceptor.accept(200).is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn depth_never_exceeds_configured_capacity() {
    let fix = setup(AdmissionConfig {
        capacity: 8,
        accept_timeout_ms: 60_000,
    });
    fix.handler.set_active(true);

    for i in 1..=50u32 {
        fix.handler.receive_new_syn(signed_syn((i % 251) as u8, i, i));
        assert!(fix.handler.depth() <= 8);
    }
    assert_eq!(fix.handler.depth(), 8);
}
