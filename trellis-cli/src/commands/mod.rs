//! CLI command implementations

pub mod config;
pub mod run;
pub mod worker;

pub use config::{handle_config_generate, handle_config_show, handle_config_validate, load_config};
pub use run::run_command;
pub use worker::run_worker_process;
