//! SQLite persistence: row models, the store, and the background writer.

mod models;
mod store;
pub mod writer;

pub use models::*;
pub use store::*;
pub use writer::{WriteRequest, WriterHandle};
