//! Background jobs that run alongside the persistence layer.
//!
//! - `archiver`: Compresses shards that left the active window
//!
//! # Usage
//!
//! ```ignore
//! use ember_repo::jobs::{archiver_task, ArchiverConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let config = ArchiverConfig::from(persistence.config());
//! tokio::spawn(archiver_task(Arc::clone(&persistence), config, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod archiver;

pub use archiver::{archiver_task, ArchiverConfig, ArchiverMetrics, ArchiverSnapshot};
