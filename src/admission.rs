//! Inbound connection admission.
//!
//! A bounded FIFO sits between the packet dispatcher and the application's
//! `accept()` call. The bound is the primary defense against SYN floods and
//! slow consumers: producers never block, every drop is cheap, and the
//! remote retries. Each queued packet carries a deadline; on expiry a SYN
//! answers with a reset and a stranded non-SYN is re-dispatched or
//! released. Shutdown wakes a blocked consumer through an in-band poison
//! sentinel and drains the backlog with resets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::manager::{Connection, ConnectionManager, PacketCodec};
use crate::packet::{Packet, FLAG_RESET, FLAG_SIGNATURE_INCLUDED, FLAG_SYNCHRONIZE};
use crate::queue::BoundedQueue;
use crate::timer::{TimedEvent, TimerHandle, TimerService};

/// Hard bound on the admission backlog.
///
/// This is both SYNs and the non-SYN packets queued alongside them to keep
/// ordering. Removal by expired deadlines scans the queue, so the bound
/// should stay small.
pub const MAX_QUEUE_SIZE: usize = 64;

/// Max time between `receive_new_syn` and the matching `accept`, in
/// milliseconds.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 3_000;

/// Tuneables for the admission queue.
#[derive(Clone, Copy, Debug)]
pub struct AdmissionConfig {
    /// Backlog capacity.
    pub capacity: usize,
    /// Per-entry deadline after enqueue, in milliseconds.
    pub accept_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_QUEUE_SIZE,
            accept_timeout_ms: DEFAULT_ACCEPT_TIMEOUT_MS,
        }
    }
}

/// Operational counters for the admission path.
///
/// All fields are shared handles, safe to clone out to a monitoring thread.
#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    /// Packets successfully queued.
    pub queued_total: Arc<Mutex<u64>>,
    /// Drops because the backlog was full.
    pub drops_full: Arc<Mutex<u64>>,
    /// Drops because the listener was inactive.
    pub drops_inactive: Arc<Mutex<u64>>,
    /// SYNs dropped for carrying no sender identity.
    pub drops_no_from: Arc<Mutex<u64>>,
    /// Duplicate SYNs suppressed against a live connection.
    pub drops_duplicate: Arc<Mutex<u64>>,
    /// Would-be reset targets dropped on signature failure.
    pub drops_bad_signature: Arc<Mutex<u64>>,
    /// Connections handed out by `accept`.
    pub accepts_total: Arc<Mutex<u64>>,
    /// Queued packets that hit their deadline.
    pub timeouts_total: Arc<Mutex<u64>>,
    /// Resets handed to the outbound queue.
    pub rsts_sent: Arc<Mutex<u64>>,
}

impl AdmissionMetrics {
    fn new() -> Self {
        Self {
            queued_total: Arc::new(Mutex::new(0)),
            drops_full: Arc::new(Mutex::new(0)),
            drops_inactive: Arc::new(Mutex::new(0)),
            drops_no_from: Arc::new(Mutex::new(0)),
            drops_duplicate: Arc::new(Mutex::new(0)),
            drops_bad_signature: Arc::new(Mutex::new(0)),
            accepts_total: Arc::new(Mutex::new(0)),
            timeouts_total: Arc::new(Mutex::new(0)),
            rsts_sent: Arc::new(Mutex::new(0)),
        }
    }

    /// Export counters in Prometheus text exposition format.
    pub fn export_metrics(&self) -> String {
        format!(
            "veilstream_admission_queued_total {{}} {}\n\
             veilstream_admission_drops_full {{}} {}\n\
             veilstream_admission_drops_inactive {{}} {}\n\
             veilstream_admission_drops_no_from {{}} {}\n\
             veilstream_admission_drops_duplicate {{}} {}\n\
             veilstream_admission_drops_bad_signature {{}} {}\n\
             veilstream_admission_accepts_total {{}} {}\n\
             veilstream_admission_timeouts_total {{}} {}\n\
             veilstream_admission_rsts_sent {{}} {}\n",
            self.queued_total.lock(),
            self.drops_full.lock(),
            self.drops_inactive.lock(),
            self.drops_no_from.lock(),
            self.drops_duplicate.lock(),
            self.drops_bad_signature.lock(),
            self.accepts_total.lock(),
            self.timeouts_total.lock(),
            self.rsts_sent.lock(),
        )
    }
}

struct QueuedPacket {
    token: u64,
    packet: Packet,
}

struct Shared {
    queue: BoundedQueue<QueuedPacket>,
    active: AtomicBool,
    accept_timeout_ms: u64,
    timer: Arc<TimerService>,
    manager: Arc<dyn ConnectionManager>,
    codec: Arc<dyn PacketCodec>,
    metrics: AdmissionMetrics,
    next_token: AtomicU64,
    pending_timeouts: Mutex<HashMap<u64, TimerHandle>>,
}

/// Producer and lifecycle handle for the admission queue. Cloneable;
/// `receive_new_syn` may be called concurrently from any thread.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

/// The single consumer handle.
///
/// Deliberately not cloneable, and `accept` takes `&mut self`: the
/// duplicate-SYN check and the `receive_connection` call rely on there
/// being exactly one consumer.
pub struct Acceptor {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    /// Build an admission queue with default tuneables. Starts inactive.
    pub fn new(
        timer: Arc<TimerService>,
        manager: Arc<dyn ConnectionManager>,
        codec: Arc<dyn PacketCodec>,
    ) -> (AdmissionQueue, Acceptor) {
        Self::with_config(timer, manager, codec, AdmissionConfig::default())
    }

    /// Build an admission queue with explicit tuneables. Starts inactive.
    pub fn with_config(
        timer: Arc<TimerService>,
        manager: Arc<dyn ConnectionManager>,
        codec: Arc<dyn PacketCodec>,
        config: AdmissionConfig,
    ) -> (AdmissionQueue, Acceptor) {
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.capacity),
            active: AtomicBool::new(false),
            accept_timeout_ms: config.accept_timeout_ms,
            timer,
            manager,
            codec,
            metrics: AdmissionMetrics::new(),
            next_token: AtomicU64::new(1),
            pending_timeouts: Mutex::new(HashMap::new()),
        });
        (
            AdmissionQueue {
                shared: Arc::clone(&shared),
            },
            Acceptor { shared },
        )
    }

    /// Toggle the lifecycle flag.
    ///
    /// Turning the queue off enqueues the poison sentinel so a blocked
    /// consumer wakes and observes termination. The poison put blocks
    /// until the queue has room, which back-pressures rapid toggling.
    pub fn set_active(&self, active: bool) {
        debug!(active, "admission lifecycle toggle");
        self.shared.active.store(active, Ordering::SeqCst);
        if !active {
            self.shared.queue.put(QueuedPacket {
                token: 0,
                packet: Packet::poison(),
            });
        }
    }

    /// Current lifecycle flag.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Current backlog depth.
    pub fn depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Counter handles.
    pub fn metrics(&self) -> AdmissionMetrics {
        self.shared.metrics.clone()
    }

    /// Counters plus the live queue depth, in Prometheus text format.
    pub fn export_metrics(&self) -> String {
        format!(
            "{}veilstream_admission_queue_depth {{}} {}\n",
            self.shared.metrics.export_metrics(),
            self.depth()
        )
    }

    /// Producer entry point. Never blocks.
    ///
    /// Non-SYN packets with a zero send stream id are also queued here so
    /// they are not thrown away while the SYN ahead of them waits.
    pub fn receive_new_syn(&self, mut packet: Packet) {
        let shared = &self.shared;
        if !shared.active.load(Ordering::SeqCst) {
            warn!("dropping inbound packet, not listening");
            *shared.metrics.drops_inactive.lock() += 1;
            if packet.is_flag_set(FLAG_SYNCHRONIZE) {
                shared.send_reset(&packet);
            }
            packet.release_payload();
            return;
        }

        let token = shared.next_token.fetch_add(1, Ordering::Relaxed);
        match shared.queue.offer(QueuedPacket { token, packet }) {
            Ok(()) => {
                *shared.metrics.queued_total.lock() += 1;
                let event = Arc::new(TimeoutSyn {
                    shared: Arc::downgrade(shared),
                    token,
                });
                // holding the map lock across the schedule keeps the
                // handle in place before the event can look for it
                let mut pending = shared.pending_timeouts.lock();
                let handle = shared.timer.schedule(event, shared.accept_timeout_ms);
                pending.insert(token, handle);
            }
            Err(QueuedPacket {
                packet: mut rejected,
                ..
            }) => {
                warn!("dropping inbound packet, admission queue full");
                *shared.metrics.drops_full.lock() += 1;
                if rejected.is_flag_set(FLAG_SYNCHRONIZE) {
                    shared.send_reset(&rejected);
                }
                rejected.release_payload();
            }
        }
    }
}

impl Acceptor {
    /// Receive an incoming connection built from an admitted SYN.
    ///
    /// Blocks up to `timeout_ms`; zero or negative means wait
    /// indefinitely. Returns `None` on timeout or shutdown.
    pub fn accept(&mut self, timeout_ms: i64) -> Option<Arc<Connection>> {
        let shared = &self.shared;
        let deadline = if timeout_ms > 0 {
            Some(shared.timer.now_ms().saturating_add(timeout_ms as u64))
        } else {
            None
        };

        loop {
            if let Some(at) = deadline {
                if shared.timer.now_ms() >= at {
                    return None;
                }
            }
            if !shared.active.load(Ordering::SeqCst) {
                // fail everything we had queued up
                shared.drain_with_rst();
                return None;
            }

            let entry = match deadline {
                None => Some(shared.queue.take()),
                Some(at) => {
                    let remaining = at.saturating_sub(shared.timer.now_ms());
                    if remaining == 0 {
                        continue;
                    }
                    shared.queue.poll_timeout(Duration::from_millis(remaining))
                }
            };
            let Some(QueuedPacket { token, mut packet }) = entry else {
                continue;
            };
            if packet.is_poison() {
                return None;
            }
            shared.cancel_timeout(token);

            if packet.is_flag_set(FLAG_SYNCHRONIZE) {
                let Some(from) = packet.optional_from else {
                    warn!("dropping SYN with no sender identity");
                    *shared.metrics.drops_no_from.lock() += 1;
                    packet.release_payload();
                    continue;
                };
                // We are single-threaded here, so this is the place to
                // check for duplicate SYNs. The remote's id alone is not
                // guaranteed unique to us; require an identity match too.
                if let Some(existing) = shared
                    .manager
                    .connection_by_outbound_id(packet.receive_stream_id)
                {
                    if existing.remote_peer() == from {
                        warn!(
                            stream_id = packet.receive_stream_id,
                            "dropping duplicate SYN"
                        );
                        *shared.metrics.drops_duplicate.lock() += 1;
                        packet.release_payload();
                        continue;
                    }
                }
                match shared.manager.receive_connection(packet) {
                    Ok(connection) => {
                        *shared.metrics.accepts_total.lock() += 1;
                        return Some(connection);
                    }
                    Err(mut refused) => {
                        // forged or otherwise unacceptable, manager said no
                        refused.release_payload();
                    }
                }
            } else {
                shared.redispatch(packet);
            }
            // keep looping
        }
    }
}

impl Shared {
    fn cancel_timeout(&self, token: u64) {
        if let Some(handle) = self.pending_timeouts.lock().remove(&token) {
            self.timer.cancel(handle);
        }
    }

    fn drain_with_rst(&self) {
        while let Some(QueuedPacket { token, mut packet }) = self.queue.poll() {
            if packet.is_poison() {
                break;
            }
            self.cancel_timeout(token);
            self.send_reset(&packet);
            packet.release_payload();
        }
    }

    /// A non-SYN packet was stranded on the admission queue; hand it to
    /// its connection if one exists by now, else drop it.
    fn redispatch(&self, mut packet: Packet) {
        if self
            .manager
            .connection_by_outbound_id(packet.receive_stream_id)
            .is_some()
        {
            debug!(
                stream_id = packet.receive_stream_id,
                "re-dispatching queued non-SYN packet"
            );
            // no requeue: a SYN dropped between here and the handler must
            // not send this packet around the loop forever
            self.manager.receive_packet_direct(packet);
        } else {
            warn!("no connection for queued non-SYN packet, dropping");
            packet.release_payload();
        }
    }

    fn send_reset(&self, packet: &Packet) {
        let Some(from) = packet.optional_from else {
            return;
        };
        if !self.codec.verify_signature(packet, &from) {
            // no reply: answering a forgery makes us a spoofing amplifier
            warn!(claimed = %from, "spoofed SYN, dropping without reset");
            *self.metrics.drops_bad_signature.lock() += 1;
            return;
        }
        let mut reply = Packet::new(FLAG_RESET | FLAG_SIGNATURE_INCLUDED);
        reply.to = Some(from);
        reply.ack_through = packet.sequence_number;
        reply.send_stream_id = packet.receive_stream_id;
        reply.receive_stream_id = 0;
        reply.optional_from = Some(self.manager.local_identity());
        debug!(to = %from, "sending reset");
        self.manager.enqueue_outbound(reply);
        *self.metrics.rsts_sent.lock() += 1;
    }
}

struct TimeoutSyn {
    shared: Weak<Shared>,
    token: u64,
}

impl TimedEvent for TimeoutSyn {
    fn time_reached(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.pending_timeouts.lock().remove(&self.token);
        // act only if the packet was still queued; a concurrent accept or
        // drain may have won, and exactly one side gets the packet
        let Some(QueuedPacket { mut packet, .. }) =
            shared.queue.remove_where(|entry| entry.token == self.token)
        else {
            return;
        };
        *shared.metrics.timeouts_total.lock() += 1;
        if packet.is_flag_set(FLAG_SYNCHRONIZE) {
            shared.send_reset(&packet);
            packet.release_payload();
        } else {
            shared.redispatch(packet);
        }
    }
}
