//! Hook and test sequencing configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Order in which hooks of nested suites run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookSequence {
    /// Hooks on the same level start together; levels run one after another
    #[default]
    Parallel,
    /// Registration order going in, exact reverse coming out
    Stack,
    /// Registration order in both directions
    List,
}

impl HookSequence {
    pub const CHOICES: [&'static str; 3] = ["parallel", "stack", "list"];
}

impl FromStr for HookSequence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parallel" => Ok(HookSequence::Parallel),
            "stack" => Ok(HookSequence::Stack),
            "list" => Ok(HookSequence::List),
            _ => Err(format!("Invalid hook sequence: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub hooks: HookSequence,

    /// Whether tests without an explicit setting run concurrently
    pub concurrent: bool,
}

impl Validatable for SequenceConfig {
    fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "sequence"
    }
}
