//! loom-core
//!
//! Task scheduling and storage staging engine.
//!
//! # Modules
//! - **domain**: tasks, executors, logs, resources and the task state machine
//! - **ports**: seams to the outside world (TaskStore, Clock, IdGenerator)
//! - **impls**: in-memory TaskStore
//! - **storage**: storage backends (local, S3, generic S3, GCS, HTTP) and their registry
//! - **worker**: runs one attempt: stage inputs, run executors, stage outputs
//! - **compute**: compute backend adapters (in-process worker, batch clusters)
//! - **scheduler**: the control loop assigning queued tasks to adapters
//! - **service**: the API façade (create/get/list/cancel)
//! - **app**: wiring from a [`config::Config`] to a running engine

pub mod app;
pub mod compute;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod worker;

pub use app::{App, AppBuilder};
pub use config::Config;
pub use error::LoomError;
pub use service::TaskService;
