//! Hub device client core contracts and value types.
//!
//! This crate defines the capabilities a device session consumes (transport,
//! retry policy, credential provider, blob uploader), the error taxonomy shared
//! by every layer, and in-memory implementations for tests and local runs.
pub mod auth;
pub mod errors;
pub mod memory;
pub mod message;
pub mod retry;
pub mod transport;
pub mod upload;

pub use auth::*;
pub use errors::*;
pub use memory::*;
pub use message::*;
pub use retry::*;
pub use transport::*;
pub use upload::*;
