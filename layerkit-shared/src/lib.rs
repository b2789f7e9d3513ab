//! Types shared between the layerkit library and its command-line front end.

pub mod errors;

pub use errors::{LayerkitError, LayerkitResult};
