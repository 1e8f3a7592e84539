pub mod cli;
pub mod config;
pub mod driver;
pub mod log;
pub mod monitor;
pub mod navigator;
pub mod notify;
pub mod scheduler;
pub mod shell_completion;
pub mod store;

#[cfg(any(test, feature = "scenario-test"))]
pub mod testing;
