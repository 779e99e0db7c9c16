#[macro_use]
extern crate log;

use thiserror::Error;

pub mod power;
pub mod voice;

/// Backend fault with the non-cloneable source flattened to its message, so
/// it can travel through watch channels.
#[derive(Error, Clone, Debug)]
#[error("{0}")]
pub struct BackendError(String);

impl BackendError {
    pub fn new<S: Into<String>>(message: S) -> BackendError {
        BackendError(message.into())
    }
}

impl From<starship_battery::Error> for BackendError {
    fn from(e: starship_battery::Error) -> Self {
        BackendError(e.to_string())
    }
}

impl From<tts::Error> for BackendError {
    fn from(e: tts::Error) -> Self {
        BackendError(e.to_string())
    }
}
