//! foursight-interchange: wire and storage types shared by every foursight
//! crate.
//!
//! Queue bodies (`QueueItem` with its `Kwargs` bag), the stored result
//! records (`CheckResult`, `ActionResult`), their status enums, and the
//! timestamp-shaped `RunId` that ties a queue item to the result it produced.

mod error;
pub mod item;
mod result;
mod run_id;
mod status;

pub use error::InterchangeError;
pub use item::{Kwargs, QueueItem, RESERVED_KEYS};
pub use result::{ActionResult, CheckResult, ResultRecord};
pub use run_id::RunId;
pub use status::{ActionStatus, CheckStatus};
