// Chunked storage engine: maps a path-addressed file tree onto size-bounded blobs in a
// remote channel, keeping the local metadata and the remote blob set consistent.

mod config;
mod engine;
mod folder_ctrl;
mod path_lock;
mod reassembly;
mod transfer;
mod write_ctrl;

pub use config::*;
pub use engine::*;
pub use path_lock::*;
pub use transfer::*;
