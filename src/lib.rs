//! Review ingestion and mood-based album retrieval.
//!
//! The [`indexer`] side turns scraped reviews into fragment vectors in a
//! [`rag::vector_store::VectorIndex`]; the [`rag`] side answers free-text mood
//! queries with ranked album recommendations drawn from that index.

pub mod app;
pub mod config;
pub mod error;
pub mod indexer;
pub mod logger;
pub mod models;
pub mod rag;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{BalerError, Result};
