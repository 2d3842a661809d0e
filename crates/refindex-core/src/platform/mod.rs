//! Platform abstraction layer for cross-platform compatibility.
//!
//! All `#[cfg]` blocks for OS-specific behavior live in this module rather
//! than scattered throughout the codebase.
//!
//! - `paths` - Platform-specific directories
//! - `process` - Process liveness, port ownership, termination

pub mod paths;
pub mod process;

pub use process::{
    find_listening_pid, is_port_listening, is_process_alive, process_command_line,
    terminate_process,
};
