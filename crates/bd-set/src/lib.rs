#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bd_row::{BindingError, DataBinding, DataRow, Metadata, RowRef, ScalarDataRow};
use bd_types::Scalar;
use thiserror::Error;

/// Lazy sequence of rows. Every `get_rows` call starts a fresh enumeration.
pub type RowIter<'a> = Box<dyn Iterator<Item = RowRef> + 'a>;

pub type DataSetRef = Arc<dyn DataSet>;

/// A source of rows with a known column shape.
pub trait DataSet: fmt::Debug + Send + Sync {
    fn column_count(&self) -> usize;

    /// True when the rows cannot be known without evaluating the set.
    fn is_dynamic(&self) -> bool;

    fn can_bind(&self, binding: &DataBinding) -> bool;

    /// Enumerates rows able to answer `bindings`. Rows flagged dynamic are
    /// skipped unless `include_dynamic_rows` is set.
    fn get_rows(&self, bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataSetError {
    #[error("the data set is already a member (position {position})")]
    DuplicateMember { position: usize },
}

/// Member identity is the identity of the shared allocation.
#[must_use]
pub fn same_data_set(left: &DataSetRef, right: &DataSetRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(left), Arc::as_ptr(right))
}

/// True when `binding` carries an index inside `[0, column_count)`.
#[must_use]
pub fn index_in_range(binding: &DataBinding, column_count: usize) -> bool {
    binding
        .index()
        .and_then(|index| usize::try_from(index).ok())
        .is_some_and(|index| index < column_count)
}

/// Ordered member list shared by the composite data sets.
#[derive(Debug, Clone, Default)]
pub struct DataSetList {
    members: Vec<DataSetRef>,
}

impl DataSetList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data_set: DataSetRef) -> Result<(), DataSetError> {
        if let Some(position) = self.position(&data_set) {
            return Err(DataSetError::DuplicateMember { position });
        }
        self.members.push(data_set);
        Ok(())
    }

    #[must_use]
    pub fn position(&self, data_set: &DataSetRef) -> Option<usize> {
        self.members
            .iter()
            .position(|member| same_data_set(member, data_set))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[DataSetRef] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataSetRef> {
        self.members.iter()
    }
}

/// Fixed rows with a declared column count.
#[derive(Debug, Clone)]
pub struct RowSequenceDataSet {
    rows: Vec<RowRef>,
    column_count: usize,
}

impl RowSequenceDataSet {
    #[must_use]
    pub fn new(rows: impl IntoIterator<Item = RowRef>, column_count: usize) -> Self {
        Self {
            rows: rows.into_iter().collect(),
            column_count,
        }
    }

    #[must_use]
    pub fn into_ref(self) -> DataSetRef {
        Arc::new(self)
    }
}

impl DataSet for RowSequenceDataSet {
    fn column_count(&self) -> usize {
        self.column_count
    }

    fn is_dynamic(&self) -> bool {
        self.rows.iter().any(|row| row.is_dynamic())
    }

    fn can_bind(&self, binding: &DataBinding) -> bool {
        index_in_range(binding, self.column_count)
    }

    fn get_rows(&self, _bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_> {
        Box::new(
            self.rows
                .iter()
                .filter(move |row| include_dynamic_rows || !row.is_dynamic())
                .cloned(),
        )
    }
}

/// One-column set producing a [`ScalarDataRow`] per value.
#[derive(Debug, Clone)]
pub struct ValueSequenceDataSet {
    values: Vec<Scalar>,
    metadata: Metadata,
    is_dynamic: bool,
}

impl ValueSequenceDataSet {
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

    /// Metadata attached to every produced row.
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
    pub fn into_ref(self) -> DataSetRef {
        Arc::new(self)
    }
}

impl DataSet for ValueSequenceDataSet {
    fn column_count(&self) -> usize {
        1
    }

    fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    fn can_bind(&self, binding: &DataBinding) -> bool {
        index_in_range(binding, 1)
    }

    fn get_rows(&self, _bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_> {
        if self.is_dynamic && !include_dynamic_rows {
            return Box::new(std::iter::empty());
        }
        Box::new(self.values.iter().map(|value| {
            ScalarDataRow::new(value.clone())
                .with_metadata(self.metadata.clone())
                .dynamic(self.is_dynamic)
                .into_ref()
        }))
    }
}

type AliasTable = HashMap<String, i64>;

fn translate_with_aliases(aliases: &AliasTable, binding: &DataBinding) -> DataBinding {
    match binding.path().and_then(|path| aliases.get(path)) {
        Some(&index) => binding.replace_index(Some(index)),
        None => binding.clone(),
    }
}

/// A named data set that maps symbolic paths onto column indices of its
/// members.
///
/// A binding whose path is registered as an alias has its index replaced by
/// the alias, whatever index it carried. Any other binding passes through
/// untouched. Rows of all members are produced in member order.
#[derive(Debug, Clone)]
pub struct DataSource {
    name: String,
    members: DataSetList,
    aliases: Arc<AliasTable>,
}

impl DataSource {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: DataSetList::new(),
            aliases: Arc::new(AliasTable::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn data_sets(&self) -> &[DataSetRef] {
        self.members.as_slice()
    }

    pub fn add_data_set(&mut self, data_set: DataSetRef) -> Result<(), DataSetError> {
        self.members.push(data_set)
    }

    /// Registers `path` as an alias for `index`, replacing any earlier alias
    /// for the same path.
    pub fn add_index_alias(&mut self, path: impl Into<String>, index: i64) {
        Arc::make_mut(&mut self.aliases).insert(path.into(), index);
    }

    #[must_use]
    pub fn translate_binding(&self, binding: &DataBinding) -> DataBinding {
        translate_with_aliases(&self.aliases, binding)
    }

    #[must_use]
    pub fn into_ref(self) -> DataSetRef {
        Arc::new(self)
    }
}

impl DataSet for DataSource {
    fn column_count(&self) -> usize {
        self.members.iter().map(|member| member.column_count()).sum()
    }

    fn is_dynamic(&self) -> bool {
        self.members.iter().any(|member| member.is_dynamic())
    }

    fn can_bind(&self, binding: &DataBinding) -> bool {
        let translated = self.translate_binding(binding);
        self.members.iter().all(|member| member.can_bind(&translated))
    }

    fn get_rows(&self, bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_> {
        let translated = bindings
            .iter()
            .map(|binding| self.translate_binding(binding))
            .collect::<Vec<_>>();
        let aliases = Arc::clone(&self.aliases);

        Box::new(self.members.iter().flat_map(move |member| {
            let aliases = Arc::clone(&aliases);
            member
                .get_rows(&translated, include_dynamic_rows)
                .map(move |inner| {
                    Arc::new(AliasedDataRow {
                        inner,
                        aliases: Arc::clone(&aliases),
                    }) as RowRef
                })
        }))
    }
}

/// Row of a [`DataSource`]; applies the alias table again on lookup so
/// callers can keep using their original bindings.
#[derive(Debug)]
struct AliasedDataRow {
    inner: RowRef,
    aliases: Arc<AliasTable>,
}

impl DataRow for AliasedDataRow {
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        self.inner
            .get_value(&translate_with_aliases(&self.aliases, binding))
    }

    fn populate_metadata(&self, metadata: &mut Metadata) {
        self.inner.populate_metadata(metadata);
    }

    fn is_dynamic(&self) -> bool {
        self.inner.is_dynamic()
    }
}
