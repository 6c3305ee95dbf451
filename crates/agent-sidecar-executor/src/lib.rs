//! Supervised execution of the `cagent` binary.
//!
//! Provides:
//! - Command building and executable resolution
//! - Process tree termination
//! - `Supervisor`, the process-backed `Executor`

pub mod command;
pub mod config;
pub mod process_tree;
pub mod supervisor;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use config::SupervisorConfig;
pub use process_tree::{KillReport, KillTreeConfig, ProcessTree, ProcessTreeError, UnixProcessTree, kill_tree};
pub use supervisor::{InitError, Supervisor};
