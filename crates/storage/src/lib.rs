//! foursight-storage: the result store and the object stores beneath it.

pub mod conformance;
mod error;
mod fs;
mod memory;
mod object;
mod results;
pub mod retry;

pub use error::StorageError;
pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;
pub use object::{Object, ObjectMeta, ObjectStore, Precondition, WriteOutcome};
pub use results::{
    closest_run, validate_result_name, PointerOutcome, PutReport, ResultHistory, ResultStore,
};
pub use retry::{with_retry, RetryPolicy, Transient};
