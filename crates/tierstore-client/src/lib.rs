//! Object store client for tierstore
//!
//! This crate provides the remote side of object-store disks:
//! - The [`ObjectStore`] protocol with per-request accounting
//! - In-memory and directory-backed implementations
//! - Fault injection, retry with backoff, and consistency polling

pub mod connector;
pub mod consistency;
pub mod faults;
pub mod fs;
pub mod memory;
pub mod retry;
pub mod store;

pub use connector::Connector;
pub use consistency::wait_for_object_count;
pub use faults::FlakyStore;
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use retry::{RetryPolicy, with_retry};
pub use store::{ObjectInfo, ObjectStore, RequestStats};
