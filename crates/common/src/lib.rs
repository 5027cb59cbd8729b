//! Types shared by the flow engine and the gate service

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
