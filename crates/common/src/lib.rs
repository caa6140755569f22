//! Types shared by the shorts publisher crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
