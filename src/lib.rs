//! oxiflash-gc - garbage collection core for a log-structured flash
//! filesystem
//!
//! The main storage area is append-only: segments fill up, user updates
//! invalidate blocks in place, and space comes back only by relocating
//! the surviving blocks of a victim section and handing the emptied
//! segments to the next checkpoint. This crate implements that cycle:
//!
//! - **Victim selection**: bounded scans over the dirty-segment bitmaps
//!   under greedy or cost-benefit ranking
//! - **Relocation**: node-segment and data-segment movers that revalidate
//!   every block against the node address table before touching it
//! - **Orchestration**: per-section passes that cooperate with the
//!   checkpoint writer, from a synchronous entry point or the paced
//!   background worker
//!
//! The surrounding filesystem is reached through the [`fs::GcTarget`]
//! trait; [`fs::mem::MemFs`] is a complete in-memory host used by the
//! test suite.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxiflash_gc::{GcConfig, GcManager, GcWorker};
//!
//! let gc = Arc::new(GcManager::new(fs, GcConfig::load_from_env()?));
//! let worker = GcWorker::spawn(Arc::clone(&gc))?;
//!
//! // Reclaim synchronously when free space runs out.
//! let status = gc.run(true);
//!
//! worker.stop();
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod dirty;
pub mod error;
pub mod fs;
pub mod gc;
pub mod layout;
pub mod sit;
pub mod stats;
pub mod status;
pub mod summary;
pub mod types;
pub mod victim;
pub mod worker;

// Re-exports for convenience
pub use config::{GcConfig, GcTuning};
pub use error::{GcError, GcResult};
pub use gc::{ClassifyPolicy, GcManager};
pub use status::GcStatus;
pub use victim::{AllocMode, GcKind, GcMode, VictimPolicy};
pub use worker::GcWorker;
