//! App: wiring of ports, backends and the scheduler into a running engine.

pub mod builder;

pub use self::builder::{App, AppBuilder};
