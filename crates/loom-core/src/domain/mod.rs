//! Domain model: IDs, task spec, state machine, attempt logs, errors.

pub mod assignment;
pub mod errors;
pub mod ids;
pub mod log;
pub mod resources;
pub mod state;
pub mod task;

pub use assignment::Assignment;
pub use errors::{IllegalTransitionError, ValidationError};
pub use ids::{AssignmentId, ParseIdError, TaskId};
pub use log::{AttemptOutcome, AttemptReport, ExecutorLog, OutputFileLog, TaskLog};
pub use resources::{GIB, Resources};
pub use state::{TaskEvent, TaskState};
pub use task::{Executor, FileType, Input, Output, Task, TaskSpec, TaskView};
