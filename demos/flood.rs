//! Flood the admission queue with signed SYNs, accept what fits, and print
//! the metrics export.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use veilstream::admission::AdmissionQueue;
use veilstream::manager::{Connection, ConnectionManager, PacketCodec};
use veilstream::packet::{Identity, Packet, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE};
use veilstream::timer::{MonotonicTime, TimerService};

#[derive(Default)]
struct DemoManager {
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
    outbound: Mutex<Vec<Packet>>,
}

impl ConnectionManager for DemoManager {
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

    fn receive_packet_direct(&self, _packet: Packet) {}

    fn enqueue_outbound(&self, packet: Packet) {
        self.outbound.lock().push(packet);
    }

    fn local_identity(&self) -> Identity {
        Identity::from_bytes([0x11; 32])
    }
}

struct DemoCodec;

impl PacketCodec for DemoCodec {
    fn verify_signature(&self, packet: &Packet, claimed_sender: &Identity) -> bool {
        packet.signature.as_deref() == Some(claimed_sender.as_bytes().as_slice())
    }
}

fn signed_syn(id: u32) -> Packet {
    let from = Identity::from_bytes([(id % 251) as u8; 32]);
    let mut packet = Packet::new(FLAG_SYNCHRONIZE | FLAG_SIGNATURE_INCLUDED);
    packet.optional_from = Some(from);
    packet.send_stream_id = 1_000 + id;
    packet.receive_stream_id = id;
    packet.sequence_number = 1;
    packet.signature = Some(from.as_bytes().to_vec());
    packet.with_payload(vec![0u8; 64])
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let timer = Arc::new(TimerService::spawn(Arc::new(MonotonicTime::new())));
    let manager = Arc::new(DemoManager::default());
    let (handler, mut acceptor) =
        AdmissionQueue::new(Arc::clone(&timer), manager.clone(), Arc::new(DemoCodec));

    handler.set_active(true);
    for id in 1..=100 {
        handler.receive_new_syn(signed_syn(id));
    }

    let mut accepted = 0;
    while let Some(connection) = acceptor.accept(200) {
        accepted += 1;
        let _ = connection.receive_stream_id();
    }

    eprintln!(
        "accepted {} connections, {} resets queued",
        accepted,
        manager.outbound.lock().len()
    );
    eprintln!("{}", handler.export_metrics());

    handler.set_active(false);
    timer.shutdown();
}
