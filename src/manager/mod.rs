//! Head lifecycle
//!
//! - **HeadManager**: active head + WAL, rotation, startup catch-up
//! - **IndexBuilder**: the durable builder finished periods are handed to
//! - **MemoryBuilder**: in-memory builder, split by schema period

mod builder;
mod head_manager;

pub use builder::{IndexBuilder, MemoryBuilder};
pub use head_manager::{HeadManager, HeadManagerOptions, ManagerStats};
