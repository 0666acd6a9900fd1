//! Device drivers
//!
//! Only the console is needed by the system-call layer.

pub mod console;
