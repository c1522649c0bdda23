#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bd_row::{DataBinding, RowRef};
use bd_set::{DataSet, DataSetError, DataSetList, DataSetRef, RowIter};
use bd_types::ScalarKey;
use thiserror::Error;

/// Decides how the row streams of interchangeable providers are combined.
pub trait MergeStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn merge<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings: &[DataBinding],
        include_dynamic_rows: bool,
    ) -> RowIter<'a>;
}

/// Looks up one of the built-in strategies by its [`MergeStrategy::name`].
#[must_use]
pub fn merge_strategy_by_name(name: &str) -> Option<Arc<dyn MergeStrategy>> {
    match name {
        "concatenation" => Some(Arc::new(ConcatenationMergeStrategy)),
        "union" => Some(Arc::new(UnionMergeStrategy)),
        "intersection" => Some(Arc::new(IntersectionMergeStrategy)),
        _ => None,
    }
}

/// Value tuple of `row` over `bindings`, or `None` if any binding fails.
fn row_key(row: &RowRef, bindings: &[DataBinding]) -> Option<Vec<ScalarKey>> {
    bindings
        .iter()
        .map(|binding| row.get_value(binding).ok().map(|value| value.key()))
        .collect()
}

fn concatenate<'a>(
    providers: &'a [DataSetRef],
    bindings: Arc<[DataBinding]>,
    include_dynamic_rows: bool,
) -> RowIter<'a> {
    Box::new(
        providers
            .iter()
            .flat_map(move |provider| provider.get_rows(&bindings, include_dynamic_rows)),
    )
}

/// Every provider's rows, in provider order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatenationMergeStrategy;

impl MergeStrategy for ConcatenationMergeStrategy {
    fn name(&self) -> &'static str {
        "concatenation"
    }

    fn merge<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings: &[DataBinding],
        include_dynamic_rows: bool,
    ) -> RowIter<'a> {
        concatenate(providers, bindings.into(), include_dynamic_rows)
    }
}

/// Concatenation with duplicates dropped, in first-seen order.
///
/// Rows are equal when every binding evaluates to the same value on both. A
/// row on which some binding fails is never a duplicate and is always kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionMergeStrategy;

impl MergeStrategy for UnionMergeStrategy {
    fn name(&self) -> &'static str {
        "union"
    }

    fn merge<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings: &[DataBinding],
        include_dynamic_rows: bool,
    ) -> RowIter<'a> {
        let bindings: Arc<[DataBinding]> = bindings.into();
        let rows = concatenate(providers, Arc::clone(&bindings), include_dynamic_rows);
        if providers.len() <= 1 {
            return rows;
        }

        let mut seen = HashSet::new();
        Box::new(rows.filter(move |row| match row_key(row, &bindings) {
            Some(key) => seen.insert(key),
            None => true,
        }))
    }
}

/// Rows whose value tuple appears in every provider, each tuple repeated as
/// often as its smallest count among the providers.
///
/// Tuples come out in the order the first provider first produces them, and
/// every copy of a tuple is emitted together. Rows on which some binding fails
/// never match.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntersectionMergeStrategy;

impl MergeStrategy for IntersectionMergeStrategy {
    fn name(&self) -> &'static str {
        "intersection"
    }

    fn merge<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings: &[DataBinding],
        include_dynamic_rows: bool,
    ) -> RowIter<'a> {
        let Some((first, rest)) = providers.split_first() else {
            return Box::new(std::iter::empty());
        };
        if rest.is_empty() {
            return first.get_rows(bindings, include_dynamic_rows);
        }

        let mut order: Vec<Vec<ScalarKey>> = Vec::new();
        let mut candidates: HashMap<Vec<ScalarKey>, Vec<RowRef>> = HashMap::new();
        for row in first.get_rows(bindings, include_dynamic_rows) {
            let Some(key) = row_key(&row, bindings) else {
                continue;
            };
            candidates
                .entry(key)
                .or_insert_with_key(|key| {
                    order.push(key.clone());
                    Vec::new()
                })
                .push(row);
        }

        let mut quota: HashMap<Vec<ScalarKey>, usize> = candidates
            .iter()
            .map(|(key, rows)| (key.clone(), rows.len()))
            .collect();
        for provider in rest {
            let mut tally: HashMap<Vec<ScalarKey>, usize> = HashMap::new();
            for row in provider.get_rows(bindings, include_dynamic_rows) {
                if let Some(key) = row_key(&row, bindings)
                    && quota.contains_key(&key)
                {
                    *tally.entry(key).or_default() += 1;
                }
            }
            for (key, remaining) in &mut quota {
                *remaining = (*remaining).min(tally.get(key).copied().unwrap_or(0));
            }
        }

        Box::new(order.into_iter().flat_map(move |key| {
            let keep = quota.get(&key).copied().unwrap_or(0);
            let mut rows = candidates.remove(&key).unwrap_or_default();
            rows.truncate(keep);
            rows
        }))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error(transparent)]
    DataSet(#[from] DataSetError),
}

/// Treats its members as alternative sources of rows with a common shape.
///
/// The default strategy is [`ConcatenationMergeStrategy`].
#[derive(Debug, Clone)]
pub struct MergedDataSet {
    members: DataSetList,
    strategy: Arc<dyn MergeStrategy>,
}

impl Default for MergedDataSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MergedDataSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            members: DataSetList::new(),
            strategy: Arc::new(ConcatenationMergeStrategy),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn strategy(&self) -> &dyn MergeStrategy {
        self.strategy.as_ref()
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn MergeStrategy>) {
        self.strategy = strategy;
    }

    #[must_use]
    pub fn data_sets(&self) -> &[DataSetRef] {
        self.members.as_slice()
    }

    pub fn add_data_set(&mut self, data_set: DataSetRef) -> Result<(), MergeError> {
        self.members.push(data_set)?;
        Ok(())
    }

    #[must_use]
    pub fn into_ref(self) -> DataSetRef {
        Arc::new(self)
    }
}

impl DataSet for MergedDataSet {
    fn column_count(&self) -> usize {
        self.members
            .iter()
            .map(|member| member.column_count())
            .max()
            .unwrap_or(0)
    }

    fn is_dynamic(&self) -> bool {
        self.members.iter().any(|member| member.is_dynamic())
    }

    fn can_bind(&self, binding: &DataBinding) -> bool {
        self.members.iter().all(|member| member.can_bind(binding))
    }

    fn get_rows(&self, bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            strategy = self.strategy.name(),
            providers = self.members.len(),
            bindings = bindings.len(),
            "merging data sets"
        );

        self.strategy
            .merge(self.members.as_slice(), bindings, include_dynamic_rows)
    }
}
