//! Field-level validation errors with Kubernetes-style paths and messages

use std::fmt;

/// A path to a field, rendered as `spec.caches[0].upstream`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Path {
    rendered: String,
}

impl Path {
    /// Root path element
    pub fn new(name: &str) -> Self {
        Self {
            rendered: name.to_string(),
        }
    }

    /// Child field
    pub fn child(&self, name: &str) -> Self {
        if self.rendered.is_empty() {
            return Self::new(name);
        }
        Self {
            rendered: format!("{}.{}", self.rendered, name),
        }
    }

    /// List element
    pub fn index(&self, i: usize) -> Self {
        Self {
            rendered: format!("{}[{}]", self.rendered, i),
        }
    }

    /// Map element
    pub fn key(&self, k: &str) -> Self {
        Self {
            rendered: format!("{}[{}]", self.rendered, k),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// Kind of field error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldErrorType {
    /// A required value is missing
    Required,
    /// The value is not acceptable
    Invalid,
    /// The value duplicates another one in a set
    Duplicate,
    /// The field may not be set or changed
    Forbidden,
    /// A referenced object does not exist
    NotFound,
}

impl FieldErrorType {
    fn as_str(&self) -> &'static str {
        match self {
            FieldErrorType::Required => "Required value",
            FieldErrorType::Invalid => "Invalid value",
            FieldErrorType::Duplicate => "Duplicate value",
            FieldErrorType::Forbidden => "Forbidden",
            FieldErrorType::NotFound => "Not found",
        }
    }
}

/// A single field error
#[derive(Clone, Debug, PartialEq)]
pub struct FieldError {
    /// Error kind
    pub type_: FieldErrorType,
    /// Rendered field path
    pub field: String,
    /// Offending value, if any
    pub bad_value: Option<serde_json::Value>,
    /// Human readable detail
    pub detail: String,
}

impl FieldError {
    /// Required value missing
    pub fn required(path: &Path, detail: impl Into<String>) -> Self {
        Self {
            type_: FieldErrorType::Required,
            field: path.to_string(),
            bad_value: None,
            detail: detail.into(),
        }
    }

    /// Invalid value
    pub fn invalid(
        path: &Path,
        value: impl Into<serde_json::Value>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            type_: FieldErrorType::Invalid,
            field: path.to_string(),
            bad_value: Some(value.into()),
            detail: detail.into(),
        }
    }

    /// Duplicate value
    pub fn duplicate(path: &Path, value: impl Into<serde_json::Value>) -> Self {
        Self {
            type_: FieldErrorType::Duplicate,
            field: path.to_string(),
            bad_value: Some(value.into()),
            detail: String::new(),
        }
    }

    /// Forbidden field
    pub fn forbidden(path: &Path, detail: impl Into<String>) -> Self {
        Self {
            type_: FieldErrorType::Forbidden,
            field: path.to_string(),
            bad_value: None,
            detail: detail.into(),
        }
    }

    /// Referenced object not found
    pub fn not_found(path: &Path, value: impl Into<serde_json::Value>) -> Self {
        Self {
            type_: FieldErrorType::NotFound,
            field: path.to_string(),
            bad_value: Some(value.into()),
            detail: String::new(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.type_.as_str())?;
        match (&self.type_, &self.bad_value) {
            (FieldErrorType::Required | FieldErrorType::Forbidden, _) | (_, None) => {}
            (_, Some(v)) => write!(f, ": {}", v)?,
        }
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// A list of field errors
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorList(pub Vec<FieldError>);

impl ErrorList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one error
    pub fn push(&mut self, err: FieldError) {
        self.0.push(err);
    }

    /// Append all errors of `other`
    pub fn extend(&mut self, other: ErrorList) {
        self.0.extend(other.0);
    }

    /// No errors recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate errors
    pub fn iter(&self) -> std::slice::Iter<'_, FieldError> {
        self.0.iter()
    }

    /// `Ok(())` if empty, the list otherwise
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [single] => write!(f, "{}", single),
            many => {
                f.write_str("[")?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl std::error::Error for ErrorList {}

impl From<FieldError> for ErrorList {
    fn from(err: FieldError) -> Self {
        Self(vec![err])
    }
}

impl IntoIterator for ErrorList {
    type Item = FieldError;
    type IntoIter = std::vec::IntoIter<FieldError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
