//! # docstore-gax
//!
//! Shared RPC support for the docstore client crates: status code
//! vocabulary, jittered exponential backoff, retry invocation helpers, and
//! cancellation/deadline bounding of RPC calls.
pub mod cancel;
pub mod grpc;
pub mod retry;
