//! Background-task supervision layer for the Atlas client.
//!
//! Launches long-running backend import jobs over HTTP, tracks their
//! lifecycle by polling the job-execution service, keeps the tracked set
//! durable across restarts, and reconciles local belief against the server's
//! authoritative status.

pub mod completion_bridge;
pub mod job_service_client;
pub mod task_registry;
pub mod task_store;
pub mod task_supervisor;

pub use completion_bridge::*;
pub use job_service_client::*;
pub use task_registry::*;
pub use task_store::*;
pub use task_supervisor::*;
