//! ignite Relay Library
//!
//! The relay turns a named action into a call against a running function
//! instance. Instances are containers named after the content-addressed key of
//! the function artifact; they are created on first use and reused after that.
//!
//! ## Architecture
//!
//! ```text
//! CommunicationService/Execute
//! └── Orchestrator
//!     ├── KeyResolver       (action -> key, mapping files)
//!     ├── Instances         (status / start / port, via ContainerRuntime)
//!     │   └── ReadinessProber
//!     └── Invoker           (FunctionRunnerService/Invoke)
//! ```
//!
//! ## Modules
//!
//! - `keys`: action to key resolution
//! - `runtime`: container runtime interface and mock
//! - `docker`: Docker Engine runtime implementation
//! - `driver`: get-or-create instance driver
//! - `readiness`: TCP readiness probing
//! - `invoker`: gRPC invocation client
//! - `orchestrator`: the `execute` state machine and start coalescing
//! - `server`: the `Execute` gRPC surface

pub mod config;
pub mod context;
pub mod docker;
pub mod driver;
pub mod invoker;
pub mod keys;
pub mod orchestrator;
pub mod readiness;
pub mod runtime;
pub mod server;

// Re-export commonly used types
pub use config::{Config, DeploymentConfig};
pub use context::{CallContext, Interrupted};
pub use driver::{DriverError, InstanceDriver, InstanceStatus, Instances};
pub use invoker::{GrpcInvoker, InvokeError, Invoker};
pub use keys::{FileKeyResolver, Key, KeyError, KeyResolver};
pub use orchestrator::{CallPhase, ExecuteError, Orchestrator};
pub use runtime::{ContainerRuntime, MockRuntime};
pub use server::RelayService;
