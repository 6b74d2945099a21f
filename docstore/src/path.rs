use std::fmt::{Display, Formatter};

/// Reserved field name addressing the document key itself. Legal only as a
/// whole field path.
pub const DOCUMENT_NAME_FIELD: &str = "__name__";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path segment must not be empty")]
    EmptySegment,

    #[error("path segment must not contain '/': {0}")]
    SlashInSegment(String),

    #[error("not a document path: {0}")]
    NotDocument(String),

    #[error("not a collection path: {0}")]
    NotCollection(String),

    #[error("invalid resource name: {0}")]
    InvalidResourceName(String),

    #[error("invalid field path: {0}")]
    InvalidFieldPath(String),
}

/// A resource path under `projects/{project}/databases/{database}/documents`.
///
/// An even, non-zero number of segments names a document; an odd number names
/// a collection. The canonical string form is the document identity used
/// throughout the client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    project_id: String,
    database_id: String,
    segments: Vec<String>,
}

impl ResourcePath {
    /// Returns the root path `projects/{project}/databases/{database}/documents`.
    pub fn root(project_id: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: database_id.into(),
            segments: vec![],
        }
    }

    /// Parses a full canonical resource name.
    pub fn parse(name: &str) -> Result<Self, PathError> {
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() < 5
            || parts[0] != "projects"
            || parts[2] != "databases"
            || parts[4] != "documents"
            || parts[1].is_empty()
            || parts[3].is_empty()
        {
            return Err(PathError::InvalidResourceName(name.to_string()));
        }
        let mut path = ResourcePath::root(parts[1], parts[3]);
        for segment in &parts[5..] {
            path = path.append(segment)?;
        }
        Ok(path)
    }

    pub fn append(&self, segment: &str) -> Result<Self, PathError> {
        if segment.is_empty() {
            return Err(PathError::EmptySegment);
        }
        if segment.contains('/') {
            return Err(PathError::SlashInSegment(segment.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Ok(Self {
            project_id: self.project_id.clone(),
            database_id: self.database_id.clone(),
            segments,
        })
    }

    /// Appends a relative path of `/`-separated segments.
    pub fn append_relative(&self, relative: &str) -> Result<Self, PathError> {
        let mut path = self.clone();
        for segment in relative.split('/') {
            path = path.append(segment)?;
        }
        Ok(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self {
            project_id: self.project_id.clone(),
            database_id: self.database_id.clone(),
            segments,
        })
    }

    pub fn is_document(&self) -> bool {
        !self.segments.is_empty() && self.segments.len() % 2 == 0
    }

    pub fn is_collection(&self) -> bool {
        self.segments.len() % 2 == 1
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment, if any.
    pub fn id(&self) -> Option<&str> {
        self.segments.last().map(|s| s.as_str())
    }

    /// The `projects/{project}/databases/{database}` prefix.
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database_id)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/documents", self.database_name())?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// A [`ResourcePath`] known to name a document. The canonical string form is
/// the document identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    inner: ResourcePath,
}

impl DocumentPath {
    pub fn new(inner: ResourcePath) -> Result<Self, PathError> {
        if !inner.is_document() {
            return Err(PathError::NotDocument(inner.to_string()));
        }
        Ok(Self { inner })
    }

    pub fn parse(name: &str) -> Result<Self, PathError> {
        Self::new(ResourcePath::parse(name)?)
    }

    /// Builds a document path from a `collection/doc/...` relative path.
    pub fn from_relative(
        project_id: impl Into<String>,
        database_id: impl Into<String>,
        relative: &str,
    ) -> Result<Self, PathError> {
        Self::new(ResourcePath::root(project_id, database_id).append_relative(relative)?)
    }

    pub fn collection(&self) -> CollectionPath {
        // a document always has a collection parent
        CollectionPath {
            inner: self.inner.parent().unwrap(),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id().unwrap()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.inner
    }
}

impl Display for DocumentPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

/// A [`ResourcePath`] known to name a collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    inner: ResourcePath,
}

impl CollectionPath {
    pub fn new(inner: ResourcePath) -> Result<Self, PathError> {
        if !inner.is_collection() {
            return Err(PathError::NotCollection(inner.to_string()));
        }
        Ok(Self { inner })
    }

    pub fn doc(&self, id: &str) -> Result<DocumentPath, PathError> {
        DocumentPath::new(self.inner.append(id)?)
    }

    pub fn id(&self) -> &str {
        self.inner.id().unwrap()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.inner
    }
}

impl Display for CollectionPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

/// An ordered list of field names addressing a value inside a document.
///
/// The string grammar is dotted segments. A backtick-quoted segment may
/// contain any character; `` \` `` and `\\` are the only escapes. Unquoted
/// segments must be simple identifiers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::InvalidFieldPath("empty field path".to_string()));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(PathError::InvalidFieldPath("empty field name".to_string()));
            }
        }
        if segments.len() > 1 && segments.iter().any(|s| s == DOCUMENT_NAME_FIELD) {
            return Err(PathError::InvalidFieldPath(format!(
                "{DOCUMENT_NAME_FIELD} is only valid as a whole field path"
            )));
        }
        Ok(Self { segments })
    }

    pub fn from_segments(segments: &[&str]) -> Result<Self, PathError> {
        Self::new(segments.iter().map(|s| s.to_string()).collect())
    }

    /// Parses the dotted form, honoring backtick quoting.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let invalid = || PathError::InvalidFieldPath(raw.to_string());
        let mut segments = vec![];
        let mut current = String::new();
        let mut quoted = false;
        let mut closed = false;
        let mut boundary = true;
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '.' if !quoted => {
                    if current.is_empty() && !closed {
                        return Err(invalid());
                    }
                    segments.push(std::mem::take(&mut current));
                    boundary = true;
                    closed = false;
                    continue;
                }
                _ if closed => return Err(invalid()),
                '`' if boundary => quoted = true,
                '`' if quoted => {
                    quoted = false;
                    closed = true;
                }
                '\\' if quoted => {
                    // only \` and \\ are meaningful inside quotes
                    match chars.next() {
                        Some(escaped @ ('`' | '\\')) => current.push(escaped),
                        Some(other) => {
                            current.push('\\');
                            current.push(other);
                        }
                        None => return Err(invalid()),
                    }
                }
                _ if quoted => current.push(c),
                _ => {
                    if !is_identifier_char(c, boundary && current.is_empty()) {
                        return Err(invalid());
                    }
                    current.push(c);
                }
            }
            boundary = false;
        }
        if quoted || (current.is_empty() && !closed) {
            return Err(invalid());
        }
        segments.push(current);
        Self::new(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Non-strict prefix test; equal paths are prefixes of each other.
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.segments.len() <= other.segments.len()
            && self.segments.iter().zip(other.segments.iter()).all(|(a, b)| a == b)
    }
}

fn is_identifier_char(c: char, first: bool) -> bool {
    c == '_' || c.is_ascii_alphabetic() || (!first && c.is_ascii_digit())
}

fn is_simple_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if is_identifier_char(c, true) => {}
        _ => return false,
    }
    chars.all(|c| is_identifier_char(c, false))
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            if is_simple_identifier(segment) {
                write!(f, "{segment}")?;
            } else {
                let escaped = segment.replace('\\', "\\\\").replace('`', "\\`");
                write!(f, "`{escaped}`")?;
            }
        }
        Ok(())
    }
}
