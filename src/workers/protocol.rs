use std::fmt;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::rembg::{Cutout, ProgressEvent, ProgressSender};
use crate::workers::task::{ImageRequest, Task, TaskId};

/// Slot ordinal plus the generation of the unit occupying it. Restarted
/// units keep the ordinal and get a fresh generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId {
    pub ordinal: usize,
    pub generation: u64,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rembg-worker-{}#{}", self.ordinal, self.generation)
    }
}

/// Coordinator → unit.
#[derive(Debug)]
pub(crate) enum Directive {
    Init,
    Run { task_id: TaskId, request: ImageRequest },
}

/// Unit → coordinator.
#[derive(Debug)]
pub(crate) enum UnitMessage {
    Ready,
    Progress(ProgressEvent),
    Complete(Cutout),
    Error(PoolError),
}

/// Everything the coordinator reacts to, on one channel so handling is
/// strictly serialized.
pub(crate) enum Event {
    Initialize {
        progress: Option<ProgressSender>,
    },
    Submit(Task),
    Unit {
        unit: UnitId,
        message: UnitMessage,
    },
    Fault {
        unit: UnitId,
        error: PoolError,
    },
    Restart {
        ordinal: usize,
    },
    Terminate {
        done: Option<oneshot::Sender<()>>,
    },
}
