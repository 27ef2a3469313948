use thiserror::Error;

use crate::component::ComponentError;
use crate::coordinator::{MutationError, StorageError};
use crate::event::{EventError, RequestError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    #[error("Component error: {0}")]
    Component(#[from] ComponentError),
    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Config error: {0}")]
    Config(String),
}

pub type InternalResult<T> = Result<T, Error>;

