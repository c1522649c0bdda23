#![forbid(unsafe_code)]

//! Turns independent sources of tabular data into the rows fed to
//! data-driven tests.
//!
//! Leaf data sets ([`RowSequenceDataSet`], [`ValueSequenceDataSet`],
//! [`DataSource`]) are combined side by side with a [`JoinedDataSet`] or one
//! after another with a [`MergedDataSet`]. [`generate_rows`] then resolves a
//! list of [`DataBinding`]s against every produced row under a
//! [`RuntimePolicy`].

pub use bd_join::{
    CombinatorialJoinStrategy, JoinError, JoinIter, JoinStrategy, JoinedDataSet,
    PairwiseJoinStrategy, SequentialJoinStrategy, join_strategy_by_name,
};
pub use bd_merge::{
    ConcatenationMergeStrategy, IntersectionMergeStrategy, MergeError, MergeStrategy,
    MergedDataSet, UnionMergeStrategy, merge_strategy_by_name,
};
pub use bd_row::{
    BindingError, BindingScope, DataBinding, DataRow, ListDataRow, Metadata, NullDataRow, RowRef,
    ScalarDataRow, ScopeOwner,
};
pub use bd_runtime::{
    DecisionAction, DecisionRecord, EvidenceLedger, GenerationIssue, IssueKind, RuntimeError,
    RuntimeMode, RuntimePolicy,
};
pub use bd_set::{
    DataSet, DataSetError, DataSetList, DataSetRef, DataSource, RowIter, RowSequenceDataSet,
    ValueSequenceDataSet, index_in_range, same_data_set,
};
pub use bd_types::{DType, NullKind, Scalar, ScalarKey, TypeError, cast_scalar};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The concrete argument list for one generated test instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRow {
    /// Position of the row in the data set's output, counting skipped rows.
    pub ordinal: usize,
    pub values: Vec<Scalar>,
    pub metadata: Metadata,
    pub is_dynamic: bool,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerateError {
    #[error("row {ordinal} could not be bound: {source}")]
    Binding {
        ordinal: usize,
        #[source]
        source: BindingError,
    },
    #[error("data set produced more than {cap} row(s)")]
    RowCapExceeded { cap: usize },
}

/// Materialises `bindings` against every row of `data_set`, each value
/// converted to its binding's value type.
///
/// Rows that fail to bind and rows past the policy's cap are handed to
/// `policy`; every decision it makes is recorded in `ledger`.
pub fn generate_rows(
    data_set: &dyn DataSet,
    bindings: &[DataBinding],
    policy: &RuntimePolicy,
    ledger: &mut EvidenceLedger,
) -> Result<Vec<GeneratedRow>, GenerateError> {
    let mut generated = Vec::new();

    for (ordinal, row) in data_set
        .get_rows(bindings, policy.include_dynamic_rows)
        .enumerate()
    {
        match policy.decide_row_cap(generated.len(), ledger) {
            DecisionAction::Allow => {}
            DecisionAction::Reject => {
                return Err(GenerateError::RowCapExceeded {
                    cap: policy.row_cap.unwrap_or(generated.len()),
                });
            }
            DecisionAction::Repair => {
                #[cfg(feature = "tracing")]
                tracing::warn!(produced = generated.len(), "row cap reached, truncating");
                break;
            }
        }

        let values = bindings
            .iter()
            .map(|binding| row.get_converted_value(binding))
            .collect::<Result<Vec<_>, _>>();
        let values = match values {
            Ok(values) => values,
            Err(source) => {
                let action = policy.decide_binding_failure(
                    format!("row {ordinal}"),
                    source.to_string(),
                    ledger,
                );
                if action == DecisionAction::Reject {
                    return Err(GenerateError::Binding { ordinal, source });
                }
                #[cfg(feature = "tracing")]
                tracing::debug!(ordinal, error = %source, "skipping row that failed to bind");
                continue;
            }
        };

        generated.push(GeneratedRow {
            ordinal,
            values,
            metadata: row.metadata(),
            is_dynamic: row.is_dynamic(),
        });
    }

    Ok(generated)
}
