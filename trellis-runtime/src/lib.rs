//! Execution context runtime for Trellis
//!
//! Everything that runs inside an execution context lives here: the module
//! loading seam, the collection API test files register through, fixtures,
//! the hook engine, per-suite scheduling, the file runner and the service
//! loop that talks to the orchestrator.

pub mod collector;
pub mod context;
pub mod error;
pub mod fixtures;
pub mod hooks;
pub mod loader;
pub mod runner;
pub mod scheduler;
pub mod script;
pub mod worker;

// Re-export commonly used types
pub use collector::{CollectedFile, Collector, Registry, SuiteBuilder, TaskFn};
pub use context::{CommandClient, EventEmitter, FileEnv, TestContext};
pub use error::{FixtureError, LoadError, RuntimeError};
pub use fixtures::{FixtureDef, FixtureRegistry, FixtureScope, FixtureSet, FixtureStore};
pub use hooks::{HookRef, HookSchedule};
pub use loader::{ExecutableModule, FnModule, LoadRequest, ModuleCache, ModuleLoader, StaticLoader};
pub use runner::{FileOutcome, FileRunner, RunSettings};
pub use scheduler::{partition_children, Segment, SuiteLimiter};
pub use script::{ScriptLoader, ScriptModule};
pub use trellis_core::TestFailure;
pub use worker::{worker_main, ExecutionContext};

/// Fail the current test unless `cond` holds
#[macro_export]
macro_rules! check {
    ($cond:expr $(,)?) => {
        if !$cond {
            return Err($crate::TestFailure::new(concat!(
                "check failed: ",
                stringify!($cond)
            )));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::TestFailure::new(format!($($arg)+)));
        }
    };
}

/// Fail the current test unless `actual == expected`, recording a diff
#[macro_export]
macro_rules! check_eq {
    ($actual:expr, $expected:expr $(,)?) => {
        match (&$actual, &$expected) {
            (actual, expected) => {
                if actual != expected {
                    return Err($crate::TestFailure::new(format!(
                        "{} != {}",
                        stringify!($actual),
                        stringify!($expected)
                    ))
                    .with_diff(expected, actual));
                }
            }
        }
    };
}
