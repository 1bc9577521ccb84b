//! Ingress stage: reads datagrams from the input sockets, classifies them, and
//! pushes them into the queue multiplexer.
//!
//! A single thread polls all ingress sockets non-blocking. Every frame is either
//! admitted into the multiplexer or dropped with a per-reason counter; the
//! multiplexer itself never accounts for drops.

use crate::buffer_pool::{lease, FRAME_BUFFER_SIZE};
use crate::packet::Frame;
use crate::queueing::QueueMux;
use crate::switch::ForwardingTable;
use parking_lot::{Mutex, RwLock};
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Frames discarded by the ingress stage, by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct IngressDrops {
    /// Target logical queue was at capacity.
    pub queue_full: u64,
    /// Egress port absent from the forwarding table.
    pub no_route: u64,
    /// Frame addressed to the configured drop port.
    pub drop_port: u64,
    /// Datagram too short to carry the switch header.
    pub malformed: u64,
}

pub struct IngressStage {
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
    mux: Arc<QueueMux<Frame>>,
    forwarding: Arc<RwLock<ForwardingTable>>,
    drop_port: u16,
    priority_queues: usize,
    accepted: AtomicU64,
    queue_full: AtomicU64,
    no_route: AtomicU64,
    drop_port_hits: AtomicU64,
    malformed: AtomicU64,
}

impl IngressStage {
    pub fn new(
        mux: Arc<QueueMux<Frame>>,
        forwarding: Arc<RwLock<ForwardingTable>>,
        drop_port: u16,
        priority_queues: usize,
    ) -> Self {
        assert!(priority_queues > 0, "need at least one priority queue");
        Self {
            sockets: Mutex::new(Vec::new()),
            mux,
            forwarding,
            drop_port,
            priority_queues,
            accepted: AtomicU64::new(0),
            queue_full: AtomicU64::new(0),
            no_route: AtomicU64::new(0),
            drop_port_hits: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Register a bound ingress socket. Must be non-blocking.
    pub fn add_socket(&self, socket: Arc<UdpSocket>) {
        if let Ok(addr) = socket.local_addr() {
            tracing::info!(%addr, "ingress socket registered");
        }
        self.sockets.lock().push(socket);
    }

    /// Bound addresses of the registered sockets, in registration order.
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.sockets
            .lock()
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }

    /// Frames admitted into the multiplexer since start.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn drop_counts(&self) -> IngressDrops {
        IngressDrops {
            queue_full: self.queue_full.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            drop_port: self.drop_port_hits.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Classify and enqueue one parsed frame. Returns whether the frame entered
    /// the multiplexer; every false outcome bumps exactly one drop counter.
    pub fn admit(&self, frame: Frame) -> bool {
        let port = frame.header.egress_port;
        if port == self.drop_port {
            self.drop_port_hits.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.forwarding.read().route(port).is_none() {
            self.no_route.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Out-of-range traffic classes degrade to the lowest configured queue
        // rather than losing the frame.
        let queue = (frame.header.traffic_class as usize).min(self.priority_queues - 1);
        match self.mux.push(port as usize, queue, frame) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_rejected) => {
                self.queue_full.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Poll loop servicing every registered socket until `running` clears.
    pub fn run(&self, running: Arc<AtomicBool>) {
        let sockets = self.sockets.lock().clone();
        while running.load(Ordering::Relaxed) {
            let mut handled = false;
            for socket in &sockets {
                let mut writable = lease(FRAME_BUFFER_SIZE);
                match socket.recv(writable.as_mut_slice()) {
                    Ok(len) => {
                        handled = true;
                        match Frame::from_datagram(writable.freeze(len)) {
                            Some(frame) => {
                                self.admit(frame);
                            }
                            None => {
                                self.malformed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "ingress socket read failed");
                    }
                }
            }
            if !handled {
                std::thread::yield_now();
            }
        }
        tracing::info!(accepted = self.accepted(), "ingress stage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::ForwardingTable;

    fn stage(capacity: usize, priority_queues: usize) -> IngressStage {
        let mux = Arc::new(QueueMux::new(capacity, 2));
        let mut table = ForwardingTable::default();
        table.add_route(7, "127.0.0.1:9107".parse().unwrap());
        IngressStage::new(mux, Arc::new(RwLock::new(table)), 511, priority_queues)
    }

    #[test]
    fn routed_frame_is_admitted() {
        let ingress = stage(4, 2);
        assert!(ingress.admit(Frame::new(7, 1, b"payload")));
        assert_eq!(ingress.accepted(), 1);
        assert_eq!(ingress.drop_counts(), IngressDrops::default());
    }

    #[test]
    fn drop_port_frame_never_reaches_the_mux() {
        let ingress = stage(4, 1);
        assert!(!ingress.admit(Frame::new(511, 0, b"gone")));
        assert_eq!(ingress.drop_counts().drop_port, 1);
        assert_eq!(ingress.mux.overall_occupancy(), 0);
    }

    #[test]
    fn unrouted_port_counts_no_route() {
        let ingress = stage(4, 1);
        assert!(!ingress.admit(Frame::new(99, 0, b"lost")));
        assert_eq!(ingress.drop_counts().no_route, 1);
    }

    #[test]
    fn queue_full_counts_and_drops() {
        let ingress = stage(1, 1);
        assert!(ingress.admit(Frame::new(7, 0, b"first")));
        assert!(!ingress.admit(Frame::new(7, 0, b"second")));
        assert_eq!(ingress.drop_counts().queue_full, 1);
        assert_eq!(ingress.mux.occupancy(7, 0), 1);
    }

    #[test]
    fn traffic_class_is_clamped_to_configured_queues() {
        let ingress = stage(4, 2);
        assert!(ingress.admit(Frame::new(7, 9, b"noisy")));
        // Class 9 lands in the top configured queue, 1.
        assert_eq!(ingress.mux.occupancy(7, 1), 1);
        assert_eq!(ingress.mux.occupancy(7, 9), 0);
    }
}
