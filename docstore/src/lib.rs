//! # docstore
//!
//! Client library for a hosted document database: typed document and field
//! paths, validated write operations, a bulk write pipeline and a retrying
//! transaction runner.
//!
//! ## Quickstart
//!
//! ```
//! use std::sync::Arc;
//!
//! use docstore::bulk_writer::BulkWriterConfig;
//! use docstore::client::{Client, ClientConfig, Error};
//! use docstore::value::fields;
//!
//! async fn run(service: Arc<dyn docstore::apiv1::DocumentService>) -> Result<(), Error> {
//!     let config = ClientConfig {
//!         project_id: Some("local-project".to_string()),
//!         ..Default::default()
//!     };
//!     let client = Client::new(service, config)?;
//!
//!     // Bulk writes: batched, throttled, retried.
//!     let mut writer = client.bulk_writer(BulkWriterConfig::default())?;
//!     let awaiter = writer.set(client.doc("users/alice")?, fields([("points", 10i64)])).await;
//!     writer.close().await;
//!     let result = awaiter.get().await;
//!
//!     // Transactions: read, buffer writes, commit; retried on contention.
//!     let (_commit_time, ()) = client
//!         .run_transaction::<_, Error, _>(
//!             |tx| async move {
//!                 let mut tx = tx.lock().await;
//!                 let path = tx_doc_path();
//!                 let snapshot = tx.get(&path).await?;
//!                 if !snapshot.exists {
//!                     tx.create(path, fields([("points", 0i64)]))?;
//!                 }
//!                 Ok(())
//!             },
//!             None,
//!         )
//!         .await?;
//!     Ok(())
//! }
//!
//! fn tx_doc_path() -> docstore::path::DocumentPath {
//!     docstore::path::DocumentPath::from_relative("local-project", "(default)", "users/alice").unwrap()
//! }
//! ```
//!
//! ## Emulator
//!
//! Set `DOCSTORE_EMULATOR_HOST` to point the transport at a local emulator;
//! requests are rewritten and authenticated with the fixed `owner` token.
//! Client behavior is unchanged. The environment is read once per client and
//! can be injected through [`client::ClientConfig::environment`] for tests.
pub mod apiv1;
pub mod bulk_writer;
pub mod client;
pub mod document;
pub mod path;
pub mod rate_limiter;
pub mod reader;
pub mod retry;
pub mod transaction;
pub mod value;
pub mod write;
