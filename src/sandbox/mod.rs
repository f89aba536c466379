//! Docker-backed sandbox for action body execution (spec §4.4, design note
//! "Action body sandboxing"): a restricted working directory, captured
//! stdout/stderr, and a wall-clock timeout per action, never the agent's
//! own address space.

pub mod manager;

pub use manager::{ExecResult, SandboxManager};
