pub mod document_client;
pub mod model;

pub use document_client::{BatchGetStream, Client, DocumentService};
