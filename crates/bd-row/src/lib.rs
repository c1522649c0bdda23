#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use bd_types::{DType, Scalar, TypeError, cast_scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of the composite data set that scoped a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeOwner(u64);

impl ScopeOwner {
    /// Allocates an owner id that is unique for the life of the process.
    #[must_use]
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Remembers which member of which composite a binding was translated for,
/// together with the binding as the member understands it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingScope {
    owner: ScopeOwner,
    member: usize,
    inner: DataBinding,
}

impl BindingScope {
    #[must_use]
    pub fn new(owner: ScopeOwner, member: usize, inner: DataBinding) -> Self {
        Self {
            owner,
            member,
            inner,
        }
    }

    #[must_use]
    pub fn owner(&self) -> ScopeOwner {
        self.owner
    }

    #[must_use]
    pub fn member(&self) -> usize {
        self.member
    }

    #[must_use]
    pub fn inner(&self) -> &DataBinding {
        &self.inner
    }
}

/// A request for one value out of a row, by positional index and/or
/// symbolic path.
///
/// Bindings are plain values. Which of `index` and `path` is honoured is up to
/// the data set or row that receives the binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataBinding {
    #[serde(default)]
    value_type: DType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip)]
    scope: Option<Arc<BindingScope>>,
}

impl DataBinding {
    #[must_use]
    pub fn new(value_type: DType, index: Option<i64>, path: Option<String>) -> Self {
        Self {
            value_type,
            index,
            path,
            scope: None,
        }
    }

    /// Untyped binding by position.
    #[must_use]
    pub fn at(index: i64) -> Self {
        Self::new(DType::Any, Some(index), None)
    }

    /// Untyped binding by path.
    #[must_use]
    pub fn named(path: impl Into<String>) -> Self {
        Self::new(DType::Any, None, Some(path.into()))
    }

    /// Binding with neither index nor path.
    #[must_use]
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Binding scoped to one member of a composite. Value type and path come
    /// from the scope's inner binding; `index` is the composite-wide index.
    #[must_use]
    pub fn scoped(scope: BindingScope, index: Option<i64>) -> Self {
        Self {
            value_type: scope.inner.value_type,
            index,
            path: scope.inner.path.clone(),
            scope: Some(Arc::new(scope)),
        }
    }

    #[must_use]
    pub fn with_value_type(mut self, value_type: DType) -> Self {
        self.value_type = value_type;
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn value_type(&self) -> DType {
        self.value_type
    }

    #[must_use]
    pub fn index(&self) -> Option<i64> {
        self.index
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn scope(&self) -> Option<&BindingScope> {
        self.scope.as_deref()
    }

    /// Same binding with a different index. Value type, path and scope are
    /// kept.
    #[must_use]
    pub fn replace_index(&self, index: Option<i64>) -> Self {
        Self {
            index,
            ..self.clone()
        }
    }
}

impl fmt::Display for DataBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        match self.index {
            Some(index) => write!(f, "index={index}")?,
            None => f.write_str("index=<none>")?,
        }
        match self.path.as_deref() {
            Some(path) => write!(f, ", path={path:?}")?,
            None => f.write_str(", path=<none>")?,
        }
        write!(f, ", type={}", self.value_type)?;
        if self.scope.is_some() {
            f.write_str(", scoped")?;
        }
        f.write_str("}")
    }
}

/// Ordered key/value pairs describing a row. Keys may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn append(&mut self, other: &Self) {
        self.entries.extend(other.entries.iter().cloned());
    }

    /// First value registered for `key`.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn get_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BindingError {
    #[error("binding {binding} has no index but the row can only be addressed by position")]
    MissingIndex { binding: DataBinding },
    #[error("binding {binding} is out of range for a row of {len} value(s)")]
    IndexOutOfRange { binding: DataBinding, len: usize },
    #[error("could not determine the underlying data set that supports binding {binding}")]
    Unresolved { binding: DataBinding },
    #[error("row rejected binding {binding}: {reason}")]
    Rejected { binding: DataBinding, reason: String },
    #[error(transparent)]
    Conversion(#[from] TypeError),
}

/// One record handed to a single generated test instance.
pub trait DataRow: fmt::Debug + Send + Sync {
    /// Resolves `binding` against this row.
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError>;

    /// Appends this row's metadata, in order, to `metadata`.
    fn populate_metadata(&self, metadata: &mut Metadata);

    fn is_dynamic(&self) -> bool {
        false
    }

    fn is_null_row(&self) -> bool {
        false
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        self.populate_metadata(&mut metadata);
        metadata
    }

    /// [`DataRow::get_value`] followed by a conversion to the binding's value
    /// type.
    fn get_converted_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        let value = self.get_value(binding)?;
        Ok(cast_scalar(&value, binding.value_type())?)
    }
}

pub type RowRef = Arc<dyn DataRow>;

static NULL_ROW: LazyLock<RowRef> = LazyLock::new(|| Arc::new(NullDataRow));

/// Row that answers every binding with the default of the requested type.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDataRow;

impl NullDataRow {
    /// The shared instance used to pad joins.
    #[must_use]
    pub fn instance() -> RowRef {
        Arc::clone(&NULL_ROW)
    }
}

impl DataRow for NullDataRow {
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        Ok(Scalar::default_for(binding.value_type()))
    }

    fn populate_metadata(&self, _metadata: &mut Metadata) {}

    fn is_null_row(&self) -> bool {
        true
    }
}

/// Row holding a single value, addressable only at index 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarDataRow {
    value: Scalar,
    metadata: Metadata,
    is_dynamic: bool,
}

impl ScalarDataRow {
    #[must_use]
    pub fn new(value: impl Into<Scalar>) -> Self {
        Self {
            value: value.into(),
            metadata: Metadata::new(),
            is_dynamic: false,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn dynamic(mut self, is_dynamic: bool) -> Self {
        self.is_dynamic = is_dynamic;
        self
    }

    #[must_use]
    pub fn value(&self) -> &Scalar {
        &self.value
    }

    #[must_use]
    pub fn into_ref(self) -> RowRef {
        Arc::new(self)
    }
}

impl DataRow for ScalarDataRow {
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        match binding.index() {
            Some(0) => Ok(self.value.clone()),
            Some(_) => Err(BindingError::IndexOutOfRange {
                binding: binding.clone(),
                len: 1,
            }),
            None => Err(BindingError::MissingIndex {
                binding: binding.clone(),
            }),
        }
    }

    fn populate_metadata(&self, metadata: &mut Metadata) {
        metadata.append(&self.metadata);
    }

    fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }
}

/// Row holding an ordered list of values addressed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ListDataRow {
    values: Vec<Scalar>,
    metadata: Metadata,
    is_dynamic: bool,
}

impl ListDataRow {
    #[must_use]
    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Scalar>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            metadata: Metadata::new(),
            is_dynamic: false,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn dynamic(mut self, is_dynamic: bool) -> Self {
        self.is_dynamic = is_dynamic;
        self
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn into_ref(self) -> RowRef {
        Arc::new(self)
    }
}

impl DataRow for ListDataRow {
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        let Some(index) = binding.index() else {
            return Err(BindingError::MissingIndex {
                binding: binding.clone(),
            });
        };

        usize::try_from(index)
            .ok()
            .and_then(|pos| self.values.get(pos))
            .cloned()
            .ok_or_else(|| BindingError::IndexOutOfRange {
                binding: binding.clone(),
                len: self.values.len(),
            })
    }

    fn populate_metadata(&self, metadata: &mut Metadata) {
        metadata.append(&self.metadata);
    }

    fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }
}
