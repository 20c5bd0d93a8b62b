// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;
use std::io;

use crate::types::DomainId;

/// Errors returned by lifecycle and configuration operations.
#[derive(Debug)]
pub enum GovError {
    /// `domain_init` on a domain that already exists.
    AlreadyInitialized(DomainId),
    /// The domain was never initialized or has been exited.
    NotInitialized(DomainId),
    /// The operation needs a stopped domain.
    AlreadyStarted(DomainId),
    /// The operation needs a started domain.
    NotStarted(DomainId),
    /// A tunable value outside its allowed range.
    InvalidTunable {
        name: &'static str,
        value: u32,
        max: u32,
    },
    /// The domain description is unusable.
    InvalidDomain(DomainId, String),
    /// The deferred-actuation worker thread could not be created.
    WorkerSpawn(DomainId, io::Error),
}

impl fmt::Display for GovError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovError::AlreadyInitialized(id) => write!(f, "domain {id} is already initialized"),
            GovError::NotInitialized(id) => write!(f, "domain {id} is not initialized"),
            GovError::AlreadyStarted(id) => write!(f, "domain {id} is already started"),
            GovError::NotStarted(id) => write!(f, "domain {id} is not started"),
            GovError::InvalidTunable { name, value, max } => {
                write!(f, "invalid {name} {value}, must be between 0 and {max}")
            }
            GovError::InvalidDomain(id, msg) => write!(f, "invalid domain {id}: {msg}"),
            GovError::WorkerSpawn(id, e) => {
                write!(f, "failed to create worker for domain {id}: {e}")
            }
        }
    }
}

impl std::error::Error for GovError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GovError::WorkerSpawn(_, e) => Some(e),
            _ => None,
        }
    }
}

pub type GovResult<T> = std::result::Result<T, GovError>;
