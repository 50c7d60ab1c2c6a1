//! Implementations of the ports.

mod memory;
mod record;

pub use self::memory::InMemoryTaskStore;
pub use self::record::TaskRecord;
