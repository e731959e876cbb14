//! Connection and content handoff subsystem.
//!
//! # Data Flow
//! ```text
//! Source stage:  conn.new_content_writer() → spawn producer(writer)
//!                                   │
//!                         pipe (one slot) ── reader parked on Connection
//!                                   │
//! Filter stage:  conn.new_content_reader() + conn.new_content_writer()
//!                                   │
//! Output stage:  conn.flush() → reader becomes the response body stream
//! ```
//!
//! # Design Decisions
//! - A Connection holds at most one reader; allocation conflicts are errors,
//!   never panics
//! - Status and headers are plain metadata until the output stage flushes
//! - The Connection is moved between tasks, never shared

pub mod connection;
pub mod pipe;

pub use connection::{Connection, ConnectionId, TransferWatch, Transferred};
pub use pipe::{content_pipe, ContentReader, ContentWriter};
