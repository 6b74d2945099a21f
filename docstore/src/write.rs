use std::collections::BTreeMap;

use prost_types::{Timestamp, Value};

use docstore_gax::grpc::{Code, Status};

use crate::client::Error;
use crate::path::{DocumentPath, FieldPath};
use crate::value::Fields;

/// A server-checked condition attached to a write.
///
/// `Exists` and `UpdateTime` are mutually exclusive by construction; an
/// unconditional write carries no precondition at all.
#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    Exists(bool),
    UpdateTime(Timestamp),
}

/// The payload of a single write operation.
#[derive(Clone, Debug)]
pub enum WriteOp {
    Create { fields: Fields },
    Set { fields: Fields, merge: Option<Vec<FieldPath>> },
    Update { fields: BTreeMap<FieldPath, Value> },
    Delete,
}

/// A validated write operation targeting one document.
#[derive(Clone, Debug)]
pub struct Write {
    pub path: DocumentPath,
    pub op: WriteOp,
    pub precondition: Option<Precondition>,
}

impl Write {
    /// A write that creates the document, failing if it already exists.
    pub fn create(path: DocumentPath, fields: Fields) -> Write {
        Write {
            path,
            op: WriteOp::Create { fields },
            precondition: Some(Precondition::Exists(false)),
        }
    }

    /// A full replace of the document, creating it if absent.
    pub fn set(path: DocumentPath, fields: Fields) -> Write {
        Write {
            path,
            op: WriteOp::Set { fields, merge: None },
            precondition: None,
        }
    }

    /// A set restricted to the given field paths; other fields are untouched.
    pub fn set_merge(path: DocumentPath, fields: Fields, merge: Vec<FieldPath>) -> Result<Write, Error> {
        if merge.is_empty() {
            return Err(Error::InvalidArgument(
                "set with merge requires at least one field path".to_string(),
            ));
        }
        validate_disjoint(merge.iter())?;
        Ok(Write {
            path,
            op: WriteOp::Set {
                fields,
                merge: Some(merge),
            },
            precondition: None,
        })
    }

    /// An update of individual fields on an existing document.
    pub fn update(
        path: DocumentPath,
        entries: impl IntoIterator<Item = (FieldPath, Value)>,
    ) -> Result<Write, Error> {
        let fields: BTreeMap<FieldPath, Value> = entries.into_iter().collect();
        if fields.is_empty() {
            return Err(Error::InvalidArgument("update requires at least one field".to_string()));
        }
        validate_disjoint(fields.keys())?;
        Ok(Write {
            path,
            op: WriteOp::Update { fields },
            precondition: Some(Precondition::Exists(true)),
        })
    }

    pub fn delete(path: DocumentPath) -> Write {
        Write {
            path,
            op: WriteOp::Delete,
            precondition: None,
        }
    }

    /// Replaces the precondition. Create keeps its fixed `Exists(false)`;
    /// Update keeps `Exists(true)` unless strengthened with an update time.
    pub fn with_precondition(mut self, precondition: Precondition) -> Result<Write, Error> {
        match (&self.op, &precondition) {
            (WriteOp::Create { .. }, _) => {
                return Err(Error::InvalidArgument(
                    "create always requires the document to not exist".to_string(),
                ))
            }
            (WriteOp::Update { .. }, Precondition::Exists(false)) => {
                return Err(Error::InvalidArgument(
                    "update requires the document to exist".to_string(),
                ))
            }
            _ => {}
        }
        self.precondition = Some(precondition);
        Ok(self)
    }
}

fn validate_disjoint<'a>(paths: impl Iterator<Item = &'a FieldPath>) -> Result<(), Error> {
    let mut sorted: Vec<&FieldPath> = paths.collect();
    sorted.sort();
    for pair in sorted.windows(2) {
        if pair[0].is_prefix_of(pair[1]) {
            return Err(Error::InvalidArgument(format!(
                "field path {} is a prefix of {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// The server acknowledgement of one write.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResult {
    pub update_time: Option<Timestamp>,
}

/// A terminal or intermediate failure of one write.
///
/// `failed_attempts` counts server-attributed failures and starts at 1; it is
/// 0 only for client-side rejections that never reached the server.
#[derive(thiserror::Error, Debug, Clone)]
#[error("write to {path} failed after {failed_attempts} attempt(s): {code:?}: {message}")]
pub struct WriteError {
    pub code: Code,
    pub message: String,
    pub failed_attempts: u32,
    pub path: String,
}

impl WriteError {
    pub fn status(&self) -> Status {
        Status::new(self.code, self.message.clone())
    }
}
