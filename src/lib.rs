pub mod api;
pub mod build;
pub mod compiler;
pub mod context;
pub mod error;
pub mod session;
pub mod sync;
pub mod utils;

pub use compiler::Compiler;
pub use context::Context;
pub use session::SessionDirectoryManager;
pub use sync::{DirectorySync, SyncResult};
