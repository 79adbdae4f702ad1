//! Connection Tracking Core
//!
//! Fixed-capacity tables, the hook handlers that update them and the per-CPU
//! batching of closed connections toward a consumer.

pub mod batch;
pub mod conn;
pub mod error;
pub mod hooks;
pub mod map;
pub mod pending;
pub mod ports;
pub mod telemetry;
pub mod tracer;

pub use batch::{CloseBatcher, CloseEventReaders, PerfEventChannel};
pub use conn::ConnectionTable;
pub use error::{ChannelError, ConfigError, MapError};
pub use hooks::{HookContext, HookEvent, SockAddr, TriggerPoint};
pub use map::{CapacityPolicy, FixedMap, Inserted, MapValue, UpdateFlag};
pub use pending::{BoundSocket, CallCorrelator};
pub use ports::PortBindingRegistry;
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use tracer::{Tracer, TracerConfig};
