#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use bd_row::{
    BindingError, BindingScope, DataBinding, DataRow, Metadata, NullDataRow, RowRef, ScopeOwner,
};
use bd_set::{DataSet, DataSetError, DataSetList, DataSetRef, RowIter};
use bd_types::Scalar;
use thiserror::Error;

/// Lazy sequence of row tuples, one row per provider.
pub type JoinIter<'a> = Box<dyn Iterator<Item = Vec<RowRef>> + 'a>;

/// Decides which combinations of provider rows a [`JoinedDataSet`] yields.
///
/// `bindings_per_provider[i]` holds the bindings already translated into
/// provider `i`'s local column space.
pub trait JoinStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn join<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings_per_provider: Vec<Vec<DataBinding>>,
        include_dynamic_rows: bool,
    ) -> JoinIter<'a>;
}

/// Looks up one of the built-in strategies by its [`JoinStrategy::name`].
#[must_use]
pub fn join_strategy_by_name(name: &str) -> Option<Arc<dyn JoinStrategy>> {
    match name {
        "combinatorial" => Some(Arc::new(CombinatorialJoinStrategy)),
        "pairwise" => Some(Arc::new(PairwiseJoinStrategy)),
        "sequential" => Some(Arc::new(SequentialJoinStrategy)),
        _ => None,
    }
}

fn materialize(
    providers: &[DataSetRef],
    bindings_per_provider: &[Vec<DataBinding>],
    include_dynamic_rows: bool,
) -> Vec<Vec<RowRef>> {
    providers
        .iter()
        .enumerate()
        .map(|(position, provider)| {
            let bindings = bindings_per_provider
                .get(position)
                .map_or(&[][..], Vec::as_slice);
            provider.get_rows(bindings, include_dynamic_rows).collect()
        })
        .collect()
}

/// Cartesian product of all providers. The last provider varies fastest.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombinatorialJoinStrategy;

impl JoinStrategy for CombinatorialJoinStrategy {
    fn name(&self) -> &'static str {
        "combinatorial"
    }

    fn join<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings_per_provider: Vec<Vec<DataBinding>>,
        include_dynamic_rows: bool,
    ) -> JoinIter<'a> {
        if providers.is_empty() {
            return Box::new(std::iter::empty());
        }
        let row_lists = materialize(providers, &bindings_per_provider, include_dynamic_rows);
        Box::new(CartesianProduct::new(row_lists))
    }
}

struct CartesianProduct {
    row_lists: Vec<Vec<RowRef>>,
    cursor: Option<Vec<usize>>,
}

impl CartesianProduct {
    fn new(row_lists: Vec<Vec<RowRef>>) -> Self {
        let cursor = if row_lists.iter().any(Vec::is_empty) {
            None
        } else {
            Some(vec![0; row_lists.len()])
        };
        Self { row_lists, cursor }
    }
}

impl Iterator for CartesianProduct {
    type Item = Vec<RowRef>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;
        let tuple = cursor
            .iter()
            .zip(&self.row_lists)
            .map(|(&position, rows)| Arc::clone(&rows[position]))
            .collect();

        let mut exhausted = true;
        for dim in (0..cursor.len()).rev() {
            cursor[dim] += 1;
            if cursor[dim] < self.row_lists[dim].len() {
                exhausted = false;
                break;
            }
            cursor[dim] = 0;
        }
        if exhausted {
            self.cursor = None;
        }
        Some(tuple)
    }
}

/// Zips providers in lockstep. Providers that run out early are padded with
/// [`NullDataRow`] until the longest one is exhausted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialJoinStrategy;

impl JoinStrategy for SequentialJoinStrategy {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn join<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings_per_provider: Vec<Vec<DataBinding>>,
        include_dynamic_rows: bool,
    ) -> JoinIter<'a> {
        let mut cursors: Vec<Option<RowIter<'a>>> = providers
            .iter()
            .enumerate()
            .map(|(position, provider)| {
                let bindings = bindings_per_provider
                    .get(position)
                    .map_or(&[][..], Vec::as_slice);
                Some(provider.get_rows(bindings, include_dynamic_rows))
            })
            .collect();

        Box::new(std::iter::from_fn(move || {
            let mut any_row = false;
            let tuple = cursors
                .iter_mut()
                .map(|slot| {
                    let next = slot.as_mut().and_then(|rows| rows.next());
                    match next {
                        Some(row) => {
                            any_row = true;
                            row
                        }
                        None => {
                            *slot = None;
                            NullDataRow::instance()
                        }
                    }
                })
                .collect::<Vec<_>>();
            any_row.then_some(tuple)
        }))
    }
}

/// Greedy all-pairs covering: every pair of rows drawn from two different
/// providers shows up in at least one tuple, usually in far fewer tuples
/// than the full cartesian product.
///
/// With at most one provider this is the same as [`SequentialJoinStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PairwiseJoinStrategy;

impl JoinStrategy for PairwiseJoinStrategy {
    fn name(&self) -> &'static str {
        "pairwise"
    }

    fn join<'a>(
        &self,
        providers: &'a [DataSetRef],
        bindings_per_provider: Vec<Vec<DataBinding>>,
        include_dynamic_rows: bool,
    ) -> JoinIter<'a> {
        if providers.len() <= 1 {
            return SequentialJoinStrategy.join(
                providers,
                bindings_per_provider,
                include_dynamic_rows,
            );
        }

        let row_lists = materialize(providers, &bindings_per_provider, include_dynamic_rows);
        if row_lists.iter().any(Vec::is_empty) {
            return Box::new(std::iter::empty());
        }

        let mut coverage = PairCoverage::new(row_lists.iter().map(Vec::len).collect());
        Box::new(std::iter::from_fn(move || {
            let indices = coverage.next_combination()?;
            Some(
                indices
                    .iter()
                    .zip(&row_lists)
                    .map(|(&position, rows)| Arc::clone(&rows[position]))
                    .collect(),
            )
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct PairCandidate {
    score: u32,
    first_index: usize,
    second_dim: usize,
    second_index: usize,
}

/// Use counts for every pair of values across every two dimensions.
#[derive(Debug, Clone)]
struct PairCoverage {
    counts: Vec<usize>,
    // One row-major `counts[a] x counts[b]` table per dimension pair a < b.
    tables: Vec<Vec<u32>>,
}

impl PairCoverage {
    fn new(counts: Vec<usize>) -> Self {
        let mut tables = Vec::new();
        for a in 0..counts.len() {
            for b in a + 1..counts.len() {
                tables.push(vec![0; counts[a] * counts[b]]);
            }
        }
        Self { counts, tables }
    }

    fn table_slot(&self, a: usize, b: usize) -> usize {
        let dims = self.counts.len();
        a * (2 * dims - a - 1) / 2 + (b - a - 1)
    }

    fn score(
        &self,
        first_dim: usize,
        first_index: usize,
        second_dim: usize,
        second_index: usize,
    ) -> u32 {
        let (a, a_index, b, b_index) = if first_dim < second_dim {
            (first_dim, first_index, second_dim, second_index)
        } else {
            (second_dim, second_index, first_dim, first_index)
        };
        self.tables[self.table_slot(a, b)][a_index * self.counts[b] + b_index]
    }

    fn record(&mut self, indices: &[usize]) {
        for a in 0..indices.len() {
            for b in a + 1..indices.len() {
                let slot = self.table_slot(a, b);
                self.tables[slot][indices[a] * self.counts[b] + indices[b]] += 1;
            }
        }
    }

    /// Lowest-scoring pair involving `first_dim`. Dimensions already chosen
    /// are held at their chosen index.
    fn best_pair(&self, first_dim: usize, chosen: &[Option<usize>]) -> Option<PairCandidate> {
        let mut best: Option<PairCandidate> = None;
        let mut consider = |first_index: usize, second_dim: usize, second_index: usize| {
            let score = self.score(first_dim, first_index, second_dim, second_index);
            if best.is_none_or(|current| score < current.score) {
                best = Some(PairCandidate {
                    score,
                    first_index,
                    second_dim,
                    second_index,
                });
            }
        };

        for (second_dim, fixed) in chosen.iter().enumerate() {
            if second_dim == first_dim {
                continue;
            }
            for first_index in 0..self.counts[first_dim] {
                match *fixed {
                    Some(second_index) => consider(first_index, second_dim, second_index),
                    None => {
                        for second_index in 0..self.counts[second_dim] {
                            consider(first_index, second_dim, second_index);
                        }
                    }
                }
            }
        }
        best
    }

    /// Builds the next tuple, or `None` once every pair has been covered.
    ///
    /// The first pass only assigns dimensions while it keeps finding
    /// uncovered pairs. The fill pass assigns whatever is left.
    fn next_combination(&mut self) -> Option<Vec<usize>> {
        let mut chosen: Vec<Option<usize>> = vec![None; self.counts.len()];
        let mut found_uncovered = false;

        for fill in [false, true] {
            for first_dim in 0..chosen.len() {
                if chosen[first_dim].is_some() {
                    continue;
                }
                let Some(best) = self.best_pair(first_dim, &chosen) else {
                    continue;
                };
                if best.score == 0 {
                    found_uncovered = true;
                }
                if found_uncovered || fill {
                    chosen[first_dim] = Some(best.first_index);
                    chosen[best.second_dim] = Some(best.second_index);
                }
            }
            if !found_uncovered {
                return None;
            }
        }

        let indices = chosen.into_iter().collect::<Option<Vec<_>>>()?;
        self.record(&indices);
        Some(indices)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("the data set is not a member of this joined data set")]
    NotAMember,
    #[error(transparent)]
    DataSet(#[from] DataSetError),
}

#[derive(Debug, Clone)]
struct JoinLayout {
    owner: ScopeOwner,
    members: DataSetList,
    offsets: Vec<usize>,
    widths: Vec<usize>,
    column_count: usize,
}

impl JoinLayout {
    /// Member that will answer `binding`, and the binding in that member's
    /// local column space.
    fn resolve(&self, binding: &DataBinding) -> Option<(usize, DataBinding)> {
        if let Some(scope) = binding.scope().filter(|scope| scope.owner() == self.owner) {
            return Some((scope.member(), scope.inner().clone()));
        }

        let Some(external) = binding.index() else {
            return self
                .members
                .iter()
                .position(|member| member.can_bind(binding))
                .map(|member| (member, binding.clone()));
        };

        self.members.iter().enumerate().find_map(|(member, data_set)| {
            let offset = i64::try_from(self.offsets[member]).unwrap_or(i64::MAX);
            let width = i64::try_from(self.widths[member]).unwrap_or(i64::MAX);
            let internal = external.checked_sub(offset).filter(|i| (0..width).contains(i));
            let local = binding.replace_index(internal);
            data_set.can_bind(&local).then_some((member, local))
        })
    }
}

/// Places several data sets side by side. Column indices are laid out
/// member after member, and a [`JoinStrategy`] picks which row tuples to
/// produce.
///
/// The default strategy is [`CombinatorialJoinStrategy`].
#[derive(Debug, Clone)]
pub struct JoinedDataSet {
    layout: Arc<JoinLayout>,
    strategy: Arc<dyn JoinStrategy>,
}

impl Default for JoinedDataSet {
    fn default() -> Self {
        Self::new()
    }
}

impl JoinedDataSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            layout: Arc::new(JoinLayout {
                owner: ScopeOwner::allocate(),
                members: DataSetList::new(),
                offsets: Vec::new(),
                widths: Vec::new(),
                column_count: 0,
            }),
            strategy: Arc::new(CombinatorialJoinStrategy),
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn JoinStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn strategy(&self) -> &dyn JoinStrategy {
        self.strategy.as_ref()
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn JoinStrategy>) {
        self.strategy = strategy;
    }

    #[must_use]
    pub fn data_sets(&self) -> &[DataSetRef] {
        self.layout.members.as_slice()
    }

    /// Appends a member. Its columns follow those of the members already
    /// present.
    pub fn add_data_set(&mut self, data_set: DataSetRef) -> Result<(), JoinError> {
        let layout = Arc::make_mut(&mut self.layout);
        let width = data_set.column_count();
        layout.members.push(data_set)?;
        layout.offsets.push(layout.column_count);
        layout.widths.push(width);
        layout.column_count += width;
        Ok(())
    }

    /// Rewrites a binding written against `data_set` so it addresses the
    /// same column of the joined set.
    pub fn translate_binding(
        &self,
        data_set: &DataSetRef,
        binding: &DataBinding,
    ) -> Result<DataBinding, JoinError> {
        let member = self
            .layout
            .members
            .position(data_set)
            .ok_or(JoinError::NotAMember)?;
        let offset = i64::try_from(self.layout.offsets[member]).unwrap_or(i64::MAX);
        let index = binding.index().map(|index| index.saturating_add(offset));
        Ok(DataBinding::scoped(
            BindingScope::new(self.layout.owner, member, binding.clone()),
            index,
        ))
    }

    #[must_use]
    pub fn into_ref(self) -> DataSetRef {
        Arc::new(self)
    }
}

impl DataSet for JoinedDataSet {
    fn column_count(&self) -> usize {
        self.layout.column_count
    }

    fn is_dynamic(&self) -> bool {
        self.layout.members.iter().any(|member| member.is_dynamic())
    }

    fn can_bind(&self, binding: &DataBinding) -> bool {
        self.layout
            .resolve(binding)
            .and_then(|(member, local)| {
                self.layout
                    .members
                    .as_slice()
                    .get(member)
                    .map(|data_set| data_set.can_bind(&local))
            })
            .unwrap_or(false)
    }

    fn get_rows(&self, bindings: &[DataBinding], include_dynamic_rows: bool) -> RowIter<'_> {
        let mut bindings_per_provider = vec![Vec::new(); self.layout.members.len()];
        for binding in bindings {
            if let Some((member, local)) = self.layout.resolve(binding)
                && let Some(slot) = bindings_per_provider.get_mut(member)
            {
                slot.push(local);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            strategy = self.strategy.name(),
            providers = self.layout.members.len(),
            bindings = bindings.len(),
            "joining data sets"
        );

        let layout = Arc::clone(&self.layout);
        Box::new(
            self.strategy
                .join(
                    self.layout.members.as_slice(),
                    bindings_per_provider,
                    include_dynamic_rows,
                )
                .map(move |rows| {
                    Arc::new(JoinedDataRow {
                        layout: Arc::clone(&layout),
                        rows,
                    }) as RowRef
                }),
        )
    }
}

/// One tuple produced by a join, answering bindings through the member that
/// owns them.
#[derive(Debug)]
struct JoinedDataRow {
    layout: Arc<JoinLayout>,
    rows: Vec<RowRef>,
}

impl DataRow for JoinedDataRow {
    fn get_value(&self, binding: &DataBinding) -> Result<Scalar, BindingError> {
        let unresolved = || BindingError::Unresolved {
            binding: binding.clone(),
        };
        let (member, local) = self.layout.resolve(binding).ok_or_else(unresolved)?;
        self.rows
            .get(member)
            .ok_or_else(unresolved)?
            .get_value(&local)
    }

    fn populate_metadata(&self, metadata: &mut Metadata) {
        for row in &self.rows {
            row.populate_metadata(metadata);
        }
    }

    fn is_dynamic(&self) -> bool {
        self.rows.iter().any(|row| row.is_dynamic())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bd_row::{BindingError, DataBinding, DataRow, ListDataRow, Metadata, RowRef};
    use bd_set::{
        DataSet, DataSetError, DataSetRef, DataSource, RowSequenceDataSet, same_data_set,
    };
    use bd_types::{DType, Scalar};

    use super::{
        CombinatorialJoinStrategy, JoinError, JoinIter, JoinStrategy, JoinedDataSet,
        PairwiseJoinStrategy, SequentialJoinStrategy, join_strategy_by_name,
    };

    type Seen = (Vec<DataSetRef>, Vec<Vec<DataBinding>>, bool);

    /// Returns canned tuples and remembers how it was called.
    #[derive(Debug)]
    struct ScriptedJoinStrategy {
        results: Vec<Vec<RowRef>>,
        seen: Mutex<Option<Seen>>,
    }

    impl JoinStrategy for ScriptedJoinStrategy {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn join<'a>(
            &self,
            providers: &'a [DataSetRef],
            bindings_per_provider: Vec<Vec<DataBinding>>,
            include_dynamic_rows: bool,
        ) -> JoinIter<'a> {
            *self.seen.lock().expect("lock") = Some((
                providers.to_vec(),
                bindings_per_provider,
                include_dynamic_rows,
            ));
            Box::new(self.results.clone().into_iter())
        }
    }

    fn rows_set(values: &[&[i64]], column_count: usize) -> DataSetRef {
        RowSequenceDataSet::new(
            values
                .iter()
                .map(|row| ListDataRow::new(row.iter().copied()).into_ref()),
            column_count,
        )
        .into_ref()
    }

    fn ints(row: &RowRef, count: i64) -> Vec<Scalar> {
        (0..count)
            .map(|index| row.get_value(&DataBinding::at(index)).expect("value"))
            .collect()
    }

    #[test]
    fn default_strategy_is_combinatorial_and_replaceable() {
        let mut data_set = JoinedDataSet::new();
        assert_eq!(data_set.strategy().name(), CombinatorialJoinStrategy.name());

        data_set.set_strategy(Arc::new(PairwiseJoinStrategy));
        assert_eq!(data_set.strategy().name(), "pairwise");

        let data_set = data_set.with_strategy(Arc::new(SequentialJoinStrategy));
        assert_eq!(data_set.strategy().name(), "sequential");

        assert!(join_strategy_by_name("combinatorial").is_some());
        assert!(join_strategy_by_name("cartesian").is_none());
    }

    #[test]
    fn adding_data_sets_updates_shape() {
        let mut data_set = JoinedDataSet::new();
        assert_eq!(data_set.column_count(), 0);
        assert!(data_set.data_sets().is_empty());

        let first = RowSequenceDataSet::new(Vec::new(), 2).into_ref();
        data_set.add_data_set(Arc::clone(&first)).expect("first");
        assert_eq!(data_set.column_count(), 2);

        let second = RowSequenceDataSet::new(Vec::new(), 3).into_ref();
        data_set.add_data_set(Arc::clone(&second)).expect("second");
        assert_eq!(data_set.column_count(), 5);

        assert_eq!(data_set.data_sets().len(), 2);
        assert!(same_data_set(&data_set.data_sets()[0], &first));
        assert!(same_data_set(&data_set.data_sets()[1], &second));

        assert_eq!(
            data_set.add_data_set(first),
            Err(JoinError::DataSet(DataSetError::DuplicateMember { position: 0 }))
        );
    }

    #[test]
    fn dynamic_if_any_member_is_dynamic() {
        let mut data_set = JoinedDataSet::new();
        data_set
            .add_data_set(rows_set(&[&[1]], 1))
            .expect("static");
        assert!(!data_set.is_dynamic());

        data_set
            .add_data_set(
                RowSequenceDataSet::new([ListDataRow::new([2_i64]).dynamic(true).into_ref()], 1)
                    .into_ref(),
            )
            .expect("dynamic");
        assert!(data_set.is_dynamic());
    }

    #[test]
    fn can_bind_resolves_scoped_and_global_bindings() {
        let mut data_set = JoinedDataSet::new();
        let mut source = DataSource::new("");
        source.add_index_alias("path", 1);
        source
            .add_data_set(RowSequenceDataSet::new(Vec::new(), 3).into_ref())
            .expect("add");
        let source = source.into_ref();
        let rows = RowSequenceDataSet::new(Vec::new(), 2).into_ref();

        data_set.add_data_set(Arc::clone(&source)).expect("source");
        data_set.add_data_set(Arc::clone(&rows)).expect("rows");

        assert!(!data_set.can_bind(&DataBinding::unbound()), "no path or index");
        assert!(!data_set.can_bind(&DataBinding::at(5)), "past the last column");
        assert!(!data_set.can_bind(&DataBinding::at(-1)));
        assert!(data_set.can_bind(&DataBinding::named("path")), "first member alias");
        assert!(data_set.can_bind(&DataBinding::at(0)));
        assert!(data_set.can_bind(&DataBinding::at(2)));
        assert!(data_set.can_bind(&DataBinding::at(3)), "second member column 0");
        assert!(data_set.can_bind(&DataBinding::at(4)), "second member column 1");

        let scoped_path = data_set
            .translate_binding(&source, &DataBinding::named("path"))
            .expect("member");
        assert!(data_set.can_bind(&scoped_path));

        let scoped_rows = data_set
            .translate_binding(&rows, &DataBinding::at(1))
            .expect("member");
        assert_eq!(scoped_rows.index(), Some(4));
        assert!(data_set.can_bind(&scoped_rows));

        let scoped_out_of_range = data_set
            .translate_binding(&rows, &DataBinding::at(2))
            .expect("member");
        assert!(!data_set.can_bind(&scoped_out_of_range));
    }

    #[test]
    fn translate_binding_requires_membership_and_offsets_index() {
        let mut data_set = JoinedDataSet::new();
        let first = RowSequenceDataSet::new(Vec::new(), 2).into_ref();
        let second = RowSequenceDataSet::new(Vec::new(), 3).into_ref();
        data_set.add_data_set(Arc::clone(&first)).expect("first");
        data_set.add_data_set(Arc::clone(&second)).expect("second");

        let outsider = RowSequenceDataSet::new(Vec::new(), 1).into_ref();
        assert_eq!(
            data_set.translate_binding(&outsider, &DataBinding::at(0)),
            Err(JoinError::NotAMember)
        );

        let typed = DataBinding::new(DType::Int64, Some(1), Some("p".to_owned()));
        let on_first = data_set.translate_binding(&first, &typed).expect("first");
        assert_eq!(on_first.index(), Some(1));
        assert_eq!(on_first.path(), Some("p"));
        assert_eq!(on_first.value_type(), DType::Int64);

        let on_second = data_set.translate_binding(&second, &typed).expect("second");
        assert_eq!(on_second.index(), Some(3));

        let by_path = data_set
            .translate_binding(&second, &DataBinding::named("p"))
            .expect("path only");
        assert_eq!(by_path.index(), None);
        assert_eq!(by_path.path(), Some("p"));
    }

    #[test]
    fn scoped_bindings_from_another_join_are_resolved_globally() {
        let mut other = JoinedDataSet::new();
        let mut data_set = JoinedDataSet::new();
        let first = rows_set(&[&[1, 2]], 2);
        let second = rows_set(&[&[3, 4]], 2);
        other.add_data_set(Arc::clone(&second)).expect("other");
        data_set.add_data_set(Arc::clone(&first)).expect("first");
        data_set.add_data_set(Arc::clone(&second)).expect("second");

        // Scoped by `other` to its member 0, index 1: here it is read globally.
        let foreign = other
            .translate_binding(&second, &DataBinding::at(1))
            .expect("member");
        let out = data_set.get_rows(&[], true).collect::<Vec<_>>();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_value(&foreign).expect("global"), Scalar::Int64(2));
    }

    #[test]
    fn get_rows_delegates_to_the_strategy() {
        let mut data_set = JoinedDataSet::new();

        let metadata1: Metadata = [("abc", "123"), ("def", "456")].into_iter().collect();
        let metadata2: Metadata = [("ghi", "789")].into_iter().collect();

        let mut source = DataSource::new("");
        source.add_index_alias("path", 1);
        source
            .add_data_set(
                RowSequenceDataSet::new(
                    [
                        ListDataRow::new([1_i64, 2, 3])
                            .with_metadata(metadata1.clone())
                            .into_ref(),
                        ListDataRow::new([-1_i64, -2, -3])
                            .with_metadata(metadata2.clone())
                            .into_ref(),
                    ],
                    3,
                )
                .into_ref(),
            )
            .expect("rows");
        let source = source.into_ref();
        data_set.add_data_set(Arc::clone(&source)).expect("source");

        let second = RowSequenceDataSet::new(
            [
                ListDataRow::new([4_i64, 5])
                    .with_metadata(metadata2.clone())
                    .into_ref(),
                ListDataRow::new([-4_i64, -5]).dynamic(true).into_ref(),
            ],
            2,
        )
        .into_ref();
        data_set.add_data_set(Arc::clone(&second)).expect("second");

        let source_rows = source.get_rows(&[], true).collect::<Vec<_>>();
        let second_rows = second.get_rows(&[], true).collect::<Vec<_>>();
        let strategy = Arc::new(ScriptedJoinStrategy {
            results: vec![
                vec![Arc::clone(&source_rows[0]), Arc::clone(&second_rows[0])],
                vec![Arc::clone(&source_rows[1]), Arc::clone(&second_rows[1])],
            ],
            seen: Mutex::new(None),
        });
        data_set.set_strategy(strategy.clone());

        let path_binding = DataBinding::named("path");
        let index_zero = DataBinding::at(0);
        let index_one = DataBinding::at(1);
        let index_three = DataBinding::at(3);
        let bindings = vec![
            // no member can claim it
            DataBinding::unbound(),
            path_binding.clone(),
            index_zero.clone(),
            index_three,
            data_set
                .translate_binding(&source, &path_binding)
                .expect("scoped to source"),
            data_set
                .translate_binding(&second, &index_one)
                .expect("scoped to second"),
        ];

        let rows = data_set.get_rows(&bindings, true).collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);

        let (providers, per_provider, include) =
            strategy.seen.lock().expect("lock").clone().expect("called");
        assert!(include);
        assert_eq!(providers.len(), 2);
        assert!(same_data_set(&providers[0], &source));
        assert!(same_data_set(&providers[1], &second));
        assert_eq!(
            per_provider,
            vec![
                vec![path_binding.clone(), index_zero.clone(), path_binding],
                vec![index_zero, index_one],
            ]
        );

        assert!(matches!(
            rows[0].get_value(&bindings[0]),
            Err(BindingError::Unresolved { .. })
        ));
        let first = bindings
            .iter()
            .skip(1)
            .map(|binding| rows[0].get_value(binding).expect("row 0"))
            .collect::<Vec<_>>();
        assert_eq!(first, [2, 1, 4, 2, 5].map(Scalar::Int64));

        let metadata = rows[0].metadata();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get_value("abc"), Some("123"));
        assert_eq!(metadata.get_value("def"), Some("456"));
        assert_eq!(metadata.get_value("ghi"), Some("789"));
        assert!(!rows[0].is_dynamic());

        assert!(rows[1].get_value(&bindings[0]).is_err());
        let second_values = bindings
            .iter()
            .skip(1)
            .map(|binding| rows[1].get_value(binding).expect("row 1"))
            .collect::<Vec<_>>();
        assert_eq!(second_values, [-2, -1, -4, -2, -5].map(Scalar::Int64));

        let metadata = rows[1].metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get_value("ghi"), Some("789"));
        assert!(rows[1].is_dynamic());
    }

    #[test]
    fn combinatorial_yields_the_full_product_last_member_fastest() {
        let data_set = {
            let mut joined = JoinedDataSet::new();
            joined.add_data_set(rows_set(&[&[1], &[2]], 1)).expect("a");
            joined.add_data_set(rows_set(&[&[10], &[20], &[30]], 1)).expect("b");
            joined
        };

        let out = data_set
            .get_rows(&[], true)
            .map(|row| ints(&row, 2))
            .collect::<Vec<_>>();
        let expected = [(1, 10), (1, 20), (1, 30), (2, 10), (2, 20), (2, 30)]
            .into_iter()
            .map(|(a, b)| vec![Scalar::Int64(a), Scalar::Int64(b)])
            .collect::<Vec<_>>();
        assert_eq!(out, expected);
    }

    #[test]
    fn combinatorial_is_empty_without_members_or_with_an_empty_member() {
        let empty = JoinedDataSet::new();
        assert_eq!(empty.get_rows(&[], true).count(), 0);

        let mut joined = JoinedDataSet::new();
        joined.add_data_set(rows_set(&[&[1], &[2]], 1)).expect("a");
        joined.add_data_set(rows_set(&[], 1)).expect("b");
        assert_eq!(joined.get_rows(&[], true).count(), 0);
    }

    #[test]
    fn sequential_pads_short_members_with_null_rows() {
        let mut joined = JoinedDataSet::new().with_strategy(Arc::new(SequentialJoinStrategy));
        joined.add_data_set(rows_set(&[&[1], &[2], &[3]], 1)).expect("a");
        joined.add_data_set(rows_set(&[&[10]], 1)).expect("b");

        let out = joined.get_rows(&[], true).collect::<Vec<_>>();
        assert_eq!(out.len(), 3);
        let typed = DataBinding::at(1).with_value_type(DType::Int64);
        assert_eq!(out[0].get_value(&typed).expect("real"), Scalar::Int64(10));
        assert_eq!(out[2].get_value(&typed).expect("padding"), Scalar::Int64(0));
        assert_eq!(
            out[2].get_value(&DataBinding::at(0)).expect("first"),
            Scalar::Int64(3)
        );
    }

    #[test]
    fn pairwise_covers_every_cross_member_pair() {
        let mut joined = JoinedDataSet::new().with_strategy(Arc::new(PairwiseJoinStrategy));
        for base in [0_i64, 10, 20] {
            joined
                .add_data_set(rows_set(&[&[base], &[base + 1], &[base + 2]], 1))
                .expect("member");
        }

        let tuples = joined
            .get_rows(&[], true)
            .map(|row| ints(&row, 3))
            .collect::<Vec<_>>();
        assert!(tuples.len() >= 9);
        assert!(tuples.len() < 27);
        for (a, b) in [(0, 1), (0, 2), (1, 2)] {
            for x in 0..3_i64 {
                for y in 0..3_i64 {
                    let want = (
                        Scalar::Int64(a as i64 * 10 + x),
                        Scalar::Int64(b as i64 * 10 + y),
                    );
                    assert!(
                        tuples
                            .iter()
                            .any(|tuple| tuple[a] == want.0 && tuple[b] == want.1),
                        "pair {want:?} is not covered"
                    );
                }
            }
        }
    }

    #[test]
    fn pairwise_with_one_member_behaves_sequentially() {
        let mut joined = JoinedDataSet::new().with_strategy(Arc::new(PairwiseJoinStrategy));
        joined.add_data_set(rows_set(&[&[1], &[2]], 1)).expect("a");
        assert_eq!(joined.get_rows(&[], true).count(), 2);

        joined.add_data_set(rows_set(&[], 1)).expect("b");
        assert_eq!(joined.get_rows(&[], true).count(), 0);
    }

    #[test]
    fn dynamic_member_rows_are_filtered_before_joining() {
        let mut joined = JoinedDataSet::new();
        joined
            .add_data_set(
                RowSequenceDataSet::new(
                    [
                        ListDataRow::new([1_i64]).into_ref(),
                        ListDataRow::new([2_i64]).dynamic(true).into_ref(),
                    ],
                    1,
                )
                .into_ref(),
            )
            .expect("a");
        joined.add_data_set(rows_set(&[&[10]], 1)).expect("b");

        assert_eq!(joined.get_rows(&[], false).count(), 1);
        let all = joined.get_rows(&[], true).collect::<Vec<_>>();
        assert_eq!(all.len(), 2);
        assert!(all[1].is_dynamic());
    }
}
