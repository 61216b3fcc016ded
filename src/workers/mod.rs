pub mod pool;
pub(crate) mod protocol;
pub(crate) mod queue;
pub mod task;
mod unit;

pub use pool::{Pool, PoolStats};
pub use protocol::UnitId;
pub use task::{ImageRequest, TaskHandle, TaskId};
