pub mod buffer_pool;
pub mod egress;
pub mod ingress;
pub mod metrics;
pub mod packet;
pub mod queueing;
pub mod switch;
pub mod threading;

// Re-export for easier testing
pub use queueing::{QueueFull, QueueKey, QueueMux, RoundRobinMapper, WorkerMapper};
pub use switch::{ForwardingTable, Switch, SwitchConfig};
