//! Container execution over the docker CLI: job composition, blocking
//! and streaming runs, and the first-run environment checks.

pub mod runner;
pub mod script;
pub mod setup;

pub use runner::{ContainerHandle, ContainerRunner, Mount, RunOutput, RunnerConfig, StreamingRun};
pub use script::ShellJob;
pub use setup::{run_initial_setup, SetupOutcome, SetupState, StartupStatus, SETUP_TIME_BUDGET};
