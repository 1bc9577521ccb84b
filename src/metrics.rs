//! Per-port statistics and the JSON snapshot feed.
//!
//! Egress workers record one [`EgressRecord`] per transmitted frame through a
//! lock-free channel so the hot path never contends with the statistics thread.
//! The statistics thread aggregates those records, samples the multiplexer's
//! occupancy, and publishes [`SwitchSnapshot`]s that the TCP server broadcasts to
//! subscribers as JSON lines.

use crate::ingress::{IngressDrops, IngressStage};
use crate::packet::Frame;
use crate::queueing::QueueMux;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// One transmitted frame, as seen by an egress worker.
#[derive(Debug, Clone, Copy)]
pub struct EgressRecord {
    pub port: u16,
    pub latency: Duration,
    pub bytes: usize,
}

/// Hot-path handle handed to the egress workers.
pub struct MetricsCollector {
    records: Sender<EgressRecord>,
}

impl MetricsCollector {
    /// Collector plus the receiving end for the statistics thread.
    pub fn channel() -> (Arc<MetricsCollector>, Receiver<EgressRecord>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(MetricsCollector { records: tx }), rx)
    }

    pub fn record(&self, port: u16, latency: Duration, bytes: usize) {
        // A closed receiver just means statistics are gone; transmission goes on.
        let _ = self.records.send(EgressRecord {
            port,
            latency,
            bytes,
        });
    }
}

/// Cumulative per-port transmit statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortStats {
    pub frames: u64,
    pub bytes: u64,
    pub mean_latency_us: f64,
    pub max_latency_us: u64,
}

/// Occupancy of one logical queue at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOccupancy {
    pub port: usize,
    pub queue: usize,
    pub depth: usize,
}

/// Periodic state dump broadcast to metrics subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchSnapshot {
    pub overall_depth: usize,
    pub queues: Vec<QueueOccupancy>,
    pub ports: HashMap<u16, PortStats>,
    pub ingress_drops: IngressDrops,
    pub tx_errors: u64,
    pub pool_misses: u64,
}

#[derive(Default)]
struct PortAccum {
    frames: u64,
    bytes: u64,
    latency_sum_us: u64,
    latency_max_us: u64,
}

/// Build a snapshot of the multiplexer occupancy alone. Also used by tests to
/// check depth consistency from the introspection surface.
pub fn occupancy_snapshot(mux: &QueueMux<Frame>) -> (usize, Vec<QueueOccupancy>) {
    let mut queues: Vec<QueueOccupancy> = mux
        .active_queues()
        .into_iter()
        .map(|key| QueueOccupancy {
            port: key.port,
            queue: key.queue,
            depth: mux.occupancy(key.port, key.queue),
        })
        .collect();
    queues.sort_by_key(|q| (q.port, q.queue));
    (mux.overall_occupancy(), queues)
}

/// Spawn the statistics thread. It drains egress records, samples occupancy every
/// `interval`, and forwards snapshots; it exits when `running` clears.
pub fn spawn_stats_thread(
    running: Arc<AtomicBool>,
    records: Receiver<EgressRecord>,
    mux: Arc<QueueMux<Frame>>,
    ingress: Arc<IngressStage>,
    tx_errors: Arc<AtomicU64>,
    snapshots: Sender<SwitchSnapshot>,
    interval: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("Switch-Stats".to_string())
        .spawn(move || {
            let mut accums: HashMap<u16, PortAccum> = HashMap::new();
            let mut last_publish = Instant::now();
            while running.load(Ordering::Relaxed) {
                if let Ok(record) = records.recv_timeout(Duration::from_millis(20)) {
                    let accum = accums.entry(record.port).or_default();
                    let latency_us = record.latency.as_micros() as u64;
                    accum.frames += 1;
                    accum.bytes += record.bytes as u64;
                    accum.latency_sum_us += latency_us;
                    accum.latency_max_us = accum.latency_max_us.max(latency_us);
                }
                if last_publish.elapsed() >= interval {
                    let (overall_depth, queues) = occupancy_snapshot(&mux);
                    let snapshot = SwitchSnapshot {
                        overall_depth,
                        queues,
                        ports: accums
                            .iter()
                            .map(|(port, a)| {
                                (
                                    *port,
                                    PortStats {
                                        frames: a.frames,
                                        bytes: a.bytes,
                                        mean_latency_us: if a.frames == 0 {
                                            0.0
                                        } else {
                                            a.latency_sum_us as f64 / a.frames as f64
                                        },
                                        max_latency_us: a.latency_max_us,
                                    },
                                )
                            })
                            .collect(),
                        ingress_drops: ingress.drop_counts(),
                        tx_errors: tx_errors.load(Ordering::Relaxed),
                        pool_misses: crate::buffer_pool::pool_misses(),
                    };
                    tracing::debug!(
                        depth = snapshot.overall_depth,
                        queues = snapshot.queues.len(),
                        "occupancy sample"
                    );
                    let _ = snapshots.send(snapshot);
                    last_publish = Instant::now();
                }
            }
        })
        .expect("failed to spawn statistics thread")
}

/// Serve snapshots as newline-delimited JSON over TCP.
///
/// One task turns snapshots into JSON strings on a broadcast channel, another
/// accepts subscribers and forwards the stream to each connection.
pub async fn serve_snapshots(
    bind_addr: &str,
    running: Arc<AtomicBool>,
    snapshots: Receiver<SwitchSnapshot>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::sync::broadcast;

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "metrics server listening");

    let (tx, _) = broadcast::channel::<String>(100);
    let json_tx = tx.clone();
    let accept_tx = tx.clone();
    let running_json = running.clone();
    let running_accept = running;

    tokio::spawn(async move {
        loop {
            match snapshots.try_recv() {
                Ok(snapshot) => match serde_json::to_string(&snapshot) {
                    Ok(json) => {
                        let _ = json_tx.send(format!("{json}\n"));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "snapshot serialization failed");
                    }
                },
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(TryRecvError::Disconnected) => break,
            }
            if !running_json.load(Ordering::Relaxed) {
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "metrics subscriber connected");
                            let mut feed = accept_tx.subscribe();
                            tokio::spawn(async move {
                                let mut stream = stream;
                                while let Ok(line) = feed.recv().await {
                                    if stream.write_all(line.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "metrics accept failed");
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    if !running_accept.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
    });

    Ok(())
}
