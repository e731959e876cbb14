//! CGI/1.1 gateway.
//!
//! # Data Flow
//! ```text
//! Request path
//!     → translate.rs (directory mode: locate script, split PATH_INFO)
//!     → env.rs (meta-variables)
//!     → gateway.rs (spawn child, feed stdin)
//!     → headers.rs (parse header block from stdout)
//!     → gateway.rs (status + headers onto Connection, body into content pipe)
//! ```

pub mod env;
pub mod gateway;
pub mod headers;
pub mod translate;

pub use env::CgiEnv;
pub use gateway::{CgiGateway, CgiOptions, DEFAULT_BUFFER_LIMIT};
pub use headers::{parse_headers, HeaderError};
pub use translate::translate_path;
