//! Single-file copy engine driven by io_uring completions.
//!
//! The source is opened, sized and its destination created in one batch;
//! from then on reads into a small pool of registered buffers and the writes
//! that drain them are kept in flight together, with completions handled in
//! whatever order the kernel delivers them.

pub mod buffer_pool;
pub mod config;
pub mod engine;
pub mod error;
pub mod facility;
pub mod op_table;
pub mod scheduler;
pub mod uring;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use buffer_pool::{BufferPool, SlotId};
pub use config::EngineConfig;
pub use engine::{copy_file, CopyEngine, CopyStats};
pub use error::{EngineError, EngineResult};
pub use facility::{Completion, FileIdentity, IoFacility, Request};
pub use op_table::{Extent, Operation, OperationId, OperationTable};
pub use scheduler::{CopyJob, Scheduler, TransferState};
pub use uring::UringFacility;
