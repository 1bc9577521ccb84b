//! Egress worker pool: one thread per physical queue.
//!
//! Worker `w` drains physical queue `w` of the multiplexer with a bounded wait so
//! it stays responsive to the running flag, then transmits the frame on UDP to the
//! destination the forwarding table holds for the frame's egress port. A
//! `WouldBlock` on send is retried with a yield so per-port frame order is kept;
//! any other transmit error drops the frame and is counted.

use crate::metrics::MetricsCollector;
use crate::packet::Frame;
use crate::queueing::QueueMux;
use crate::switch::ForwardingTable;
use crate::threading::{pin_to_core, set_sched_class, SchedClass};
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POP_WAIT: Duration = Duration::from_millis(5);

pub struct EgressPool {
    mux: Arc<QueueMux<Frame>>,
    forwarding: Arc<RwLock<ForwardingTable>>,
    collector: Arc<MetricsCollector>,
    sent: Arc<AtomicU64>,
    tx_errors: Arc<AtomicU64>,
}

impl EgressPool {
    pub fn new(
        mux: Arc<QueueMux<Frame>>,
        forwarding: Arc<RwLock<ForwardingTable>>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            mux,
            forwarding,
            collector,
            sent: Arc::new(AtomicU64::new(0)),
            tx_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn tx_errors(&self) -> Arc<AtomicU64> {
        self.tx_errors.clone()
    }

    /// Spawn one worker thread per physical queue. Workers exit once `running`
    /// clears; `QueueMux::shutdown` wakes any that are waiting.
    pub fn spawn_workers(
        &self,
        running: Arc<AtomicBool>,
        worker_cores: &[usize],
    ) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.mux.nb_workers());
        for worker_id in 0..self.mux.nb_workers() {
            let mux = self.mux.clone();
            let forwarding = self.forwarding.clone();
            let collector = self.collector.clone();
            let running = running.clone();
            let sent = self.sent.clone();
            let tx_errors = self.tx_errors.clone();
            let core = worker_cores
                .get(worker_id % worker_cores.len().max(1))
                .copied();
            let handle = thread::Builder::new()
                .name(format!("Egress-Worker-{worker_id}"))
                .spawn(move || {
                    set_sched_class(SchedClass::Worker);
                    if let Some(core) = core {
                        pin_to_core(core);
                    }
                    run_worker(
                        worker_id, mux, forwarding, collector, running, sent, tx_errors,
                    );
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }
}

fn run_worker(
    worker_id: usize,
    mux: Arc<QueueMux<Frame>>,
    forwarding: Arc<RwLock<ForwardingTable>>,
    collector: Arc<MetricsCollector>,
    running: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
    tx_errors: Arc<AtomicU64>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(worker_id, error = %e, "egress worker could not bind");
            return;
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        tracing::error!(worker_id, error = %e, "egress worker socket setup failed");
        return;
    }

    while running.load(Ordering::Relaxed) {
        let (port, frame) = match mux.pop_wait_timeout(worker_id, POP_WAIT) {
            Some(popped) => popped,
            None => continue,
        };
        let destination = forwarding.read().route(port as u16);
        let Some(destination) = destination else {
            // Route removed by a swap after the frame was queued.
            tx_errors.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        // Record before transmission so a failed send still shows up per port.
        collector.record(port as u16, frame.ingress_at.elapsed(), frame.len());

        loop {
            match socket.send_to(frame.payload(), destination) {
                Ok(_) => {
                    sent.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // Retry instead of skipping so per-port order holds.
                    thread::yield_now();
                }
                Err(e) => {
                    tx_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(worker_id, port, error = %e, "transmit failed");
                    break;
                }
            }
        }
    }
    tracing::info!(worker_id, "egress worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn workers_drain_and_transmit() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let destination = receiver.local_addr().unwrap();

        let mux: Arc<QueueMux<Frame>> = Arc::new(QueueMux::new(8, 1));
        let mut table = ForwardingTable::default();
        table.add_route(3, destination);
        let forwarding = Arc::new(RwLock::new(table));
        let (collector, records) = MetricsCollector::channel();
        let pool = EgressPool::new(mux.clone(), forwarding, collector);

        let running = Arc::new(AtomicBool::new(true));
        let handles = pool.spawn_workers(running.clone(), &[]).unwrap();

        mux.push(3, 0, Frame::new(3, 0, b"hello")).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");

        let record = records.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.port, 3);

        running.store(false, Ordering::Relaxed);
        mux.shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.sent(), 1);
    }

    #[test]
    fn unrouted_frame_counts_as_tx_error() {
        let mux: Arc<QueueMux<Frame>> = Arc::new(QueueMux::new(8, 1));
        let forwarding = Arc::new(RwLock::new(ForwardingTable::default()));
        let (collector, _records) = MetricsCollector::channel();
        let pool = EgressPool::new(mux.clone(), forwarding, collector);

        let running = Arc::new(AtomicBool::new(true));
        let handles = pool.spawn_workers(running.clone(), &[]).unwrap();

        mux.push(9, 0, Frame::new(9, 0, b"nowhere")).unwrap();
        let errors = pool.tx_errors();
        let deadline = Instant::now() + Duration::from_secs(2);
        while errors.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(errors.load(Ordering::Relaxed), 1);

        running.store(false, Ordering::Relaxed);
        mux.shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
