//! # switchboard
//!
//! In-process component communication: a synchronous event bus, a
//! correlation-id based request/response layer on top of it, and a component
//! lifecycle with a late-join state handshake. A single coordinator owns the
//! canonical data; every other component keeps a cache it refreshes from the
//! coordinator's broadcasts.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchboard::{coordinator::MemoryStorage, System, SystemConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let system = System::new(SystemConfig::default());
//! let services = system.start_services(Arc::new(MemoryStorage::new())).await?;
//! services
//!     .bindings
//!     .component()
//!     .bind("F1", serde_json::json!("+power_toggle"))
//!     .await?;
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod services;
pub mod system;

pub use config::{CoordinatorConfig, SystemConfig};
pub use error::{Error, InternalResult};
pub use system::{Services, System};
