//! 记忆层：持久存储、去重守卫、调试产物

pub mod artifacts;
pub mod guard;
pub mod store;

pub use artifacts::{ArtifactWriter, Transcript};
pub use guard::{DedupMemoryGuard, InFlightGuard};
pub use store::{LocalMemoryStore, MemoryStore};
