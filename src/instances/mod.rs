//! Instances — per-worker records, the registry that owns them, and the
//! HTTP/WebSocket surface.

pub mod history;
pub mod model;
pub mod registry;
pub mod ws;

pub use model::{
    InstanceConfig, InstanceId, InstanceStatus, InstanceView, LogEntry, LogKind, SupervisorEvent,
};
pub use registry::InstanceRegistry;
pub use ws::instance_routes;
