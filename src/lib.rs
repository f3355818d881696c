//! Pipecast Library
//!
//! Zero-copy byte relaying between pipes, fifos and regular files on
//! Linux, built on splice(2) and tee(2): point-to-point bridging with a
//! buffered fallback, and continuous fan-out replication to a live set of
//! destinations.

pub mod copier;
pub mod copy;
pub mod pipe;
pub mod splice;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types for convenience
pub use copier::{Copier, CopierError, CopierState};
pub use copy::{SpliceRead, SpliceWrite};
pub use pipe::{PipeReader, PipeWriter, create, open, open_fifo, open_fifo_async, pipe};
pub use splice::{Budget, Descriptor, Stop};
