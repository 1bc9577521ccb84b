// Switch binary: parses the startup options, wires the switch, and keeps it
// alive until Ctrl+C.

use clap::Parser;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use torq_switch::metrics::serve_snapshots;
use torq_switch::switch::DEFAULT_DROP_PORT;
use torq_switch::{ForwardingTable, Switch, SwitchConfig};

#[derive(Debug, Parser)]
#[command(name = "torq-switch", about = "Software ToR switch data plane")]
struct Options {
    /// Enable forwarding configuration swapping at runtime
    #[arg(long)]
    enable_swap: bool,

    /// Drop port number
    #[arg(long, default_value_t = DEFAULT_DROP_PORT)]
    drop_port: u16,

    /// Number of priority queues per port
    #[arg(long, default_value = "1")]
    priority_queues: NonZeroUsize,

    /// Number of calendar queues (egress workers)
    #[arg(long, default_value = "1")]
    calendar_queues: NonZeroUsize,

    /// Per-logical-queue capacity
    #[arg(long, default_value = "64")]
    queue_capacity: NonZeroUsize,

    /// Address the metrics server binds, host[:port]
    #[arg(long, default_value = "127.0.0.1:9999")]
    metrics_bind: String,

    /// Local address to receive frames on; repeatable
    #[arg(long = "ingress-bind", default_values_t = ["127.0.0.1:8080".parse::<SocketAddr>().unwrap()])]
    ingress_binds: Vec<SocketAddr>,

    /// Static route PORT=HOST:UDP_PORT; repeatable
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(u16, SocketAddr)>,
}

/// Parse a `PORT=HOST:UDP_PORT` route argument.
fn parse_route(value: &str) -> Result<(u16, SocketAddr), String> {
    let (port, destination) = value
        .split_once('=')
        .ok_or_else(|| format!("expected PORT=HOST:UDP_PORT, got `{value}`"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid egress port `{port}`"))?;
    let destination: SocketAddr = destination
        .parse()
        .map_err(|_| format!("invalid destination `{destination}`"))?;
    Ok((port, destination))
}

fn normalize_metrics_bind(value: &str) -> String {
    if value.contains(':') {
        value.to_string()
    } else {
        format!("{value}:9999")
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();

    let config = SwitchConfig {
        queue_capacity: options.queue_capacity.get(),
        calendar_queues: options.calendar_queues.get(),
        priority_queues: options.priority_queues.get(),
        drop_port: options.drop_port,
        enable_swap: options.enable_swap,
        ingress_binds: options.ingress_binds.clone(),
        ..SwitchConfig::default()
    };

    let mut table = ForwardingTable::default();
    for (port, destination) in &options.routes {
        table.add_route(*port, *destination);
    }

    let switch = Arc::new(Switch::new(config, table)?);
    switch.start()?;

    // Metrics server on its own runtime thread, like the data-plane threads it
    // must not share a core budget with.
    let metrics_bind = normalize_metrics_bind(&options.metrics_bind);
    let snapshots = switch.snapshots();
    let running = switch.running_flag();
    std::thread::Builder::new()
        .name("Metrics-Server".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build metrics runtime");
            rt.block_on(async move {
                if let Err(e) = serve_snapshots(&metrics_bind, running.clone(), snapshots).await {
                    tracing::error!(error = %e, "metrics server failed to start");
                }
                while running.load(Ordering::Relaxed) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
        })?;

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown_requested.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
    })?;

    while !shutdown_requested.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutdown requested");
    switch.shutdown();
    Ok(())
}
