//! Switch wiring and lifecycle.
//!
//! This module connects the ingress stage, the queue multiplexer, and the egress
//! worker pool, exposes the configuration objects that make queue counts and
//! capacities tunable, and owns the running flag that drives graceful shutdown.

use crate::egress::EgressPool;
use crate::ingress::IngressStage;
use crate::metrics::{spawn_stats_thread, EgressRecord, MetricsCollector, SwitchSnapshot};
use crate::packet::Frame;
use crate::queueing::QueueMux;
use crate::threading::{pin_to_core, set_sched_class, SchedClass};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Egress port for frames the pipeline discards on purpose.
pub const DEFAULT_DROP_PORT: u16 = 511;

/// Routes from an egress port id to the UDP destination its frames are
/// transmitted to.
#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    routes: HashMap<u16, SocketAddr>,
}

impl ForwardingTable {
    pub fn add_route(&mut self, port: u16, destination: SocketAddr) {
        self.routes.insert(port, destination);
    }

    pub fn route(&self, port: u16) -> Option<SocketAddr> {
        self.routes.get(&port).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Startup configuration for the whole switch.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Items each logical queue may hold before pushes are rejected.
    pub queue_capacity: usize,
    /// Physical queues and egress worker threads.
    pub calendar_queues: usize,
    /// Traffic classes per egress port; ingress clamps the header class to this.
    pub priority_queues: usize,
    /// Frames addressed here are dropped by the pipeline, never queued.
    pub drop_port: u16,
    /// Permit forwarding-table swaps at runtime.
    pub enable_swap: bool,
    /// Local addresses the ingress stage binds.
    pub ingress_binds: Vec<SocketAddr>,
    /// Cores the egress workers are pinned to, round robin. Empty = unpinned.
    pub worker_cores: Vec<usize>,
    /// Cadence of occupancy snapshots.
    pub stats_interval: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            calendar_queues: 1,
            priority_queues: 1,
            drop_port: DEFAULT_DROP_PORT,
            enable_swap: false,
            ingress_binds: vec!["127.0.0.1:8080".parse().expect("static address")],
            worker_cores: Vec::new(),
            stats_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{option} must be at least 1")]
    ZeroNotAllowed { option: &'static str },
    #[error("no ingress sockets configured")]
    NoIngress,
}

impl SwitchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroNotAllowed {
                option: "queue-capacity",
            });
        }
        if self.calendar_queues == 0 {
            return Err(ConfigError::ZeroNotAllowed {
                option: "calendar-queues",
            });
        }
        if self.priority_queues == 0 {
            return Err(ConfigError::ZeroNotAllowed {
                option: "priority-queues",
            });
        }
        if self.ingress_binds.is_empty() {
            return Err(ConfigError::NoIngress);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime swap is disabled; restart with --enable-swap")]
    SwapDisabled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The assembled switch. Owns every stage and the running flag; lives for the
/// process lifetime behind a single top-level owner.
pub struct Switch {
    config: SwitchConfig,
    mux: Arc<QueueMux<Frame>>,
    forwarding: Arc<RwLock<ForwardingTable>>,
    ingress: Arc<IngressStage>,
    egress: Arc<EgressPool>,
    snapshots: Receiver<SwitchSnapshot>,
    snapshot_tx: crossbeam_channel::Sender<SwitchSnapshot>,
    records: Receiver<EgressRecord>,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Switch {
    /// Build the switch without starting any threads.
    pub fn new(config: SwitchConfig, forwarding: ForwardingTable) -> Result<Switch, SwitchError> {
        config.validate()?;
        let mux = Arc::new(QueueMux::new(config.queue_capacity, config.calendar_queues));
        let forwarding = Arc::new(RwLock::new(forwarding));
        let ingress = Arc::new(IngressStage::new(
            mux.clone(),
            forwarding.clone(),
            config.drop_port,
            config.priority_queues,
        ));
        let (collector, records) = MetricsCollector::channel();
        let egress = Arc::new(EgressPool::new(
            mux.clone(),
            forwarding.clone(),
            collector,
        ));
        let (snapshot_tx, snapshots) = crossbeam_channel::unbounded();
        Ok(Switch {
            config,
            mux,
            forwarding,
            ingress,
            egress,
            snapshots,
            snapshot_tx,
            records,
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Bind the ingress sockets and launch every thread: ingress, one egress
    /// worker per physical queue, and statistics.
    pub fn start(&self) -> Result<(), SwitchError> {
        self.running.store(true, Ordering::Relaxed);
        tracing::info!(
            capacity = self.config.queue_capacity,
            workers = self.config.calendar_queues,
            priority_queues = self.config.priority_queues,
            drop_port = self.config.drop_port,
            "starting switch"
        );

        for bind in &self.config.ingress_binds {
            let socket = UdpSocket::bind(bind)?;
            socket.set_nonblocking(true)?;
            self.ingress.add_socket(Arc::new(socket));
        }

        let mut handles = self.handles.lock();

        let ingress = self.ingress.clone();
        let running = self.running.clone();
        let ingress_core = self.config.worker_cores.first().copied();
        handles.push(
            thread::Builder::new()
                .name("Ingress".to_string())
                .spawn(move || {
                    set_sched_class(SchedClass::Ingress);
                    if let Some(core) = ingress_core {
                        pin_to_core(core);
                    }
                    ingress.run(running);
                })?,
        );

        handles.extend(
            self.egress
                .spawn_workers(self.running.clone(), &self.config.worker_cores)?,
        );

        handles.push(spawn_stats_thread(
            self.running.clone(),
            self.records.clone(),
            self.mux.clone(),
            self.ingress.clone(),
            self.egress.tx_errors(),
            self.snapshot_tx.clone(),
            self.config.stats_interval,
        ));

        Ok(())
    }

    /// Replace the forwarding table at runtime. The multiplexer and queued frames
    /// are untouched; only available when the switch runs with `enable-swap`.
    pub fn swap_forwarding(&self, table: ForwardingTable) -> Result<(), SwitchError> {
        if !self.config.enable_swap {
            return Err(SwitchError::SwapDisabled);
        }
        let routes = table.len();
        *self.forwarding.write() = table;
        tracing::info!(routes, "forwarding table swapped");
        Ok(())
    }

    /// Stop every thread and wait for them. Safe to call more than once.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.mux.shutdown();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::info!("switch stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn mux(&self) -> &Arc<QueueMux<Frame>> {
        &self.mux
    }

    pub fn ingress(&self) -> &Arc<IngressStage> {
        &self.ingress
    }

    pub fn egress(&self) -> &Arc<EgressPool> {
        &self.egress
    }

    /// Feed of periodic snapshots for the metrics server.
    pub fn snapshots(&self) -> Receiver<SwitchSnapshot> {
        self.snapshots.clone()
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_calendar_queues_is_rejected() {
        let config = SwitchConfig {
            calendar_queues: 0,
            ..SwitchConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroNotAllowed {
                option: "calendar-queues"
            })
        );
    }

    #[test]
    fn default_config_is_valid() {
        assert!(SwitchConfig::default().validate().is_ok());
    }

    #[test]
    fn swap_requires_the_flag() {
        let switch = Switch::new(SwitchConfig::default(), ForwardingTable::default()).unwrap();
        let result = switch.swap_forwarding(ForwardingTable::default());
        assert!(matches!(result, Err(SwitchError::SwapDisabled)));
    }

    #[test]
    fn swap_replaces_routes_when_enabled() {
        let config = SwitchConfig {
            enable_swap: true,
            ..SwitchConfig::default()
        };
        let switch = Switch::new(config, ForwardingTable::default()).unwrap();
        let mut table = ForwardingTable::default();
        table.add_route(1, "127.0.0.1:9001".parse().unwrap());
        switch.swap_forwarding(table).unwrap();
        assert_eq!(switch.forwarding.read().len(), 1);
    }
}
