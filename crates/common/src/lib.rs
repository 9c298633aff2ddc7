//! Common types shared by the key pool, the transport and the runner

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
