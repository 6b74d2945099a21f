use prost_types::value::Kind;
use prost_types::{Timestamp, Value};

use crate::path::{DocumentPath, FieldPath};
use crate::value::Fields;

/// The state of a document as observed at a particular read time.
///
/// A missing document is represented with `exists == false`, a read time and
/// no fields.
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    pub exists: bool,
    pub fields: Fields,
    pub read_time: Option<Timestamp>,
    pub create_time: Option<Timestamp>,
    pub update_time: Option<Timestamp>,
}

impl DocumentSnapshot {
    pub(crate) fn found(
        path: DocumentPath,
        fields: Fields,
        read_time: Option<Timestamp>,
        create_time: Option<Timestamp>,
        update_time: Option<Timestamp>,
    ) -> Self {
        Self {
            path,
            exists: true,
            fields,
            read_time,
            create_time,
            update_time,
        }
    }

    pub(crate) fn missing(path: DocumentPath, read_time: Option<Timestamp>) -> Self {
        Self {
            path,
            exists: false,
            fields: Fields::new(),
            read_time,
            create_time: None,
            update_time: None,
        }
    }

    /// Looks up a value by field path, descending into nested maps.
    pub fn get(&self, field_path: &FieldPath) -> Option<&Value> {
        let mut segments = field_path.segments().iter();
        let mut current = self.fields.get(segments.next()?)?;
        for segment in segments {
            current = match &current.kind {
                Some(Kind::StructValue(nested)) => nested.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{fields, IntoValue};

    fn path() -> DocumentPath {
        DocumentPath::from_relative("p", "d", "users/alice").unwrap()
    }

    #[test]
    fn test_get_nested() {
        let data = fields([(
            "address",
            fields([("city", "Springfield".into_value())]).into_value(),
        )]);
        let snapshot = DocumentSnapshot::found(path(), data, None, None, None);
        let value = snapshot.get(&FieldPath::parse("address.city").unwrap()).unwrap();
        assert_eq!(value.kind, Some(Kind::StringValue("Springfield".to_string())));
        assert!(snapshot.get(&FieldPath::parse("address.zip").unwrap()).is_none());
    }

    #[test]
    fn test_missing_has_no_fields() {
        let snapshot = DocumentSnapshot::missing(path(), Some(Timestamp::default()));
        assert!(!snapshot.exists);
        assert!(snapshot.fields.is_empty());
        assert!(snapshot.read_time.is_some());
    }
}
