//! Host-side helpers shared by the builder and the launcher.

mod process;

pub use process::{is_process_alive, kill_process, signal_process};
