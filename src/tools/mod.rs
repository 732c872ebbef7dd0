//! External process runners.

pub mod osascript;
pub mod shell;

pub use shell::{ShellOutput, ShellRunner, run_program};
