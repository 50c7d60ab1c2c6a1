//! Ports: the seams between the scheduler and the outside world.

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{CancelOutcome, ListPage, ListQuery, StoreError, TaskStore};
