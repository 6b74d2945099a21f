//! Re-export of the gRPC status vocabulary so that dependent crates do not
//! need a direct tonic dependency.
pub use tonic::{Code, Status};
