// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod mmap;
pub mod pool;
pub mod router;
pub mod server;
pub mod signals;
pub mod slab;
pub mod store;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use config::{DispatchModel, ServerConfig, TrigMode};
pub use conn::{HttpCode, HttpConn, Method};
pub use context::Context;
pub use error::{LumenError, LumenResult};
pub use logging::{init_logging, init_logging_json, init_logging_with_level};
pub use router::Router;
pub use server::Server;
pub use signals::ShutdownHandle;
pub use store::{CredentialStore, MemoryStore, StoreConnection, StorePool, UserTable};
