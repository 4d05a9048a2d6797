use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler needs at least one reactor")]
    NoReactors,
    #[error("reactor setup failed: {0}")]
    Setup(#[from] io::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    #[error("stale or unknown actor id")]
    StaleActor,
}
