//! The seam between the sync engine and the mutation endpoint.
//!
//! The engine only needs one call: send a batch of per-key transactions for
//! one document and get a verdict per key. Anything that can answer
//! [`Transport::mutate`] can back a [`crate::store::CollabStore`].

pub mod memory;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::{MutationRequest, MutationResponse, ProtocolError};

pub use memory::{MemoryServer, ServerPolicy};

/// Request/response client for the mutation endpoint.
pub trait Transport: Send + Sync {
    fn mutate(
        &self,
        request: MutationRequest,
    ) -> BoxFuture<'_, Result<MutationResponse, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn mutate(
        &self,
        request: MutationRequest,
    ) -> BoxFuture<'_, Result<MutationResponse, TransportError>> {
        (**self).mutate(request)
    }
}

/// Transport failures. All of them leave pending edits in place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out")]
    Timeout,
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
