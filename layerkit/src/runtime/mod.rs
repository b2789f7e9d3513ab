//! Runtime: home directory, stores and the public entry point.

mod core;
pub(crate) mod layout;
mod lock;
mod options;
mod rt_impl;

pub use self::core::LayerkitRuntime;
pub use layout::FilesystemLayout;
pub use lock::RuntimeLock;
pub use options::{BuildOptions, HOME_ENV, LaunchOptions, LayerkitOptions};
pub use rt_impl::{RuntimeInner, RuntimeInnerImpl};
