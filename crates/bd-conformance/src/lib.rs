#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bindery::{
    DType, DataBinding, DataSet, DataSetError, DataSetRef, DataSource, EvidenceLedger, JoinError,
    JoinedDataSet, ListDataRow, MergeError, MergedDataSet, Metadata, RowRef, RowSequenceDataSet,
    RuntimePolicy, Scalar, generate_rows, join_strategy_by_name, merge_strategy_by_name,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            strict_mode: true,
        }
    }

    #[must_use]
    pub fn with_fixture_root(mut self, fixture_root: impl Into<PathBuf>) -> Self {
        self.fixture_root = fixture_root.into();
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_root_present: bool,
    pub fixture_count: usize,
    pub strict_mode: bool,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = list_fixture_files(&config.fixture_root)
        .map(|files| files.len())
        .unwrap_or(0);

    HarnessReport {
        suite: "smoke",
        fixture_root_present: config.fixture_root.exists(),
        fixture_count,
        strict_mode: config.strict_mode,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    Join,
    Merge,
}

/// One row of a fixture provider. A `bad` row holds no values, so every
/// binding against it fails.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FixtureRow {
    #[serde(default)]
    pub values: Vec<Scalar>,
    #[serde(default)]
    pub bad: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureProvider {
    pub rows: Vec<FixtureRow>,
    /// Defaults to the widest row.
    #[serde(default)]
    pub column_count: Option<usize>,
    /// Path aliases; a non-empty table wraps the rows in a `DataSource`.
    #[serde(default)]
    pub aliases: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureBinding {
    #[serde(default)]
    pub value_type: DType,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub path: Option<String>,
    /// Join only: translate the binding as written against this provider.
    #[serde(default)]
    pub member: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FixtureExpected {
    /// One entry per produced row: the bound values, or `null` when some
    /// binding fails on that row.
    #[serde(default)]
    pub rows: Option<Vec<Option<Vec<Scalar>>>>,
    #[serde(default)]
    pub row_count: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingFixture {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub strategy: String,
    pub providers: Vec<FixtureProvider>,
    #[serde(default)]
    pub bindings: Vec<FixtureBinding>,
    #[serde(default = "default_true")]
    pub include_dynamic_rows: bool,
    /// When present, rows go through `generate_rows` under this policy and
    /// `expected.rows` lists the generated values.
    #[serde(default)]
    pub policy: Option<RuntimePolicy>,
    pub expected: FixtureExpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub strategy: String,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    pub evidence_records: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    DataSet(#[from] DataSetError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

pub fn run_fixture_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, None)?;
    build_report("binding_fixtures".to_owned(), &fixtures)
}

pub fn run_fixture_by_id(
    config: &HarnessConfig,
    case_id: &str,
) -> Result<SuiteReport, HarnessError> {
    let fixtures = load_fixtures(config, Some(case_id))?;
    build_report(format!("binding_fixtures:{case_id}"), &fixtures)
}

/// Parses and validates one fixture document.
pub fn parse_fixture(body: &str) -> Result<BindingFixture, HarnessError> {
    let fixture: BindingFixture = serde_json::from_str(body)?;
    let known = match fixture.operation {
        FixtureOperation::Join => join_strategy_by_name(&fixture.strategy).is_some(),
        FixtureOperation::Merge => merge_strategy_by_name(&fixture.strategy).is_some(),
    };
    if !known {
        return Err(HarnessError::FixtureFormat(format!(
            "{}: unknown {:?} strategy {:?}",
            fixture.case_id, fixture.operation, fixture.strategy
        )));
    }
    if fixture.expected.rows.is_none() && fixture.expected.row_count.is_none() {
        return Err(HarnessError::FixtureFormat(format!(
            "{}: expected needs rows or row_count",
            fixture.case_id
        )));
    }
    Ok(fixture)
}

fn build_report(suite: String, fixtures: &[BindingFixture]) -> Result<SuiteReport, HarnessError> {
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in fixtures {
        results.push(run_fixture(fixture)?);
    }

    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);

    Ok(SuiteReport {
        suite,
        fixture_count: results.len(),
        passed,
        failed,
        results,
    })
}

fn load_fixtures(
    config: &HarnessConfig,
    case_filter: Option<&str>,
) -> Result<Vec<BindingFixture>, HarnessError> {
    let fixture_files = list_fixture_files(&config.fixture_root)?;
    let mut fixtures = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let fixture = load_fixture(&fixture_path)?;
        if case_filter.is_none_or(|case_id| fixture.case_id == case_id) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

fn load_fixture(path: &Path) -> Result<BindingFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    parse_fixture(&body)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn run_fixture(fixture: &BindingFixture) -> Result<CaseResult, HarnessError> {
    let (scenario, bindings) = build_scenario(fixture)?;
    let data_set: &dyn DataSet = scenario.as_ref();
    let mut ledger = EvidenceLedger::new();

    let produced: Result<Vec<Option<Vec<Scalar>>>, String> = match &fixture.policy {
        Some(policy) => generate_rows(data_set, &bindings, policy, &mut ledger)
            .map(|rows| rows.into_iter().map(|row| Some(row.values)).collect())
            .map_err(|err| format!("generation failed: {err}")),
        None => Ok(data_set
            .get_rows(&bindings, fixture.include_dynamic_rows)
            .map(|row| bind_row(&row, &bindings))
            .collect::<Vec<_>>()),
    };
    let mismatch = produced
        .and_then(|rows| compare_expected(&fixture.expected, &rows))
        .err();

    Ok(CaseResult {
        case_id: fixture.case_id.clone(),
        operation: fixture.operation,
        strategy: fixture.strategy.clone(),
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        evidence_records: ledger.len(),
    })
}

fn bind_row(row: &RowRef, bindings: &[DataBinding]) -> Option<Vec<Scalar>> {
    bindings
        .iter()
        .map(|binding| row.get_converted_value(binding).ok())
        .collect()
}

fn build_provider(provider: &FixtureProvider) -> Result<DataSetRef, HarnessError> {
    let widest = provider
        .rows
        .iter()
        .map(|row| row.values.len())
        .max()
        .unwrap_or(0);
    let rows = provider.rows.iter().map(|row| {
        let values = if row.bad { Vec::new() } else { row.values.clone() };
        let metadata = row.metadata.iter().collect::<Metadata>();
        ListDataRow::new(values)
            .with_metadata(metadata)
            .dynamic(row.dynamic)
            .into_ref()
    });
    let leaf = RowSequenceDataSet::new(rows, provider.column_count.unwrap_or(widest));

    if provider.aliases.is_empty() {
        return Ok(leaf.into_ref());
    }
    let mut source = DataSource::new("fixture");
    for (path, index) in &provider.aliases {
        source.add_index_alias(path.clone(), *index);
    }
    source.add_data_set(leaf.into_ref())?;
    Ok(source.into_ref())
}

fn build_scenario(
    fixture: &BindingFixture,
) -> Result<(DataSetRef, Vec<DataBinding>), HarnessError> {
    let providers = fixture
        .providers
        .iter()
        .map(build_provider)
        .collect::<Result<Vec<_>, _>>()?;
    let unknown_strategy =
        || HarnessError::FixtureFormat(format!("unknown strategy {:?}", fixture.strategy));

    match fixture.operation {
        FixtureOperation::Join => {
            let strategy = join_strategy_by_name(&fixture.strategy).ok_or_else(unknown_strategy)?;
            let mut joined = JoinedDataSet::new().with_strategy(strategy);
            for provider in &providers {
                joined.add_data_set(Arc::clone(provider))?;
            }

            let mut bindings = Vec::with_capacity(fixture.bindings.len());
            for written in &fixture.bindings {
                let binding =
                    DataBinding::new(written.value_type, written.index, written.path.clone());
                let binding = match written.member {
                    Some(member) => {
                        let provider = providers.get(member).ok_or_else(|| {
                            HarnessError::FixtureFormat(format!(
                                "{}: binding names provider {member} of {}",
                                fixture.case_id,
                                providers.len()
                            ))
                        })?;
                        joined.translate_binding(provider, &binding)?
                    }
                    None => binding,
                };
                bindings.push(binding);
            }
            Ok((joined.into_ref(), bindings))
        }
        FixtureOperation::Merge => {
            let strategy =
                merge_strategy_by_name(&fixture.strategy).ok_or_else(unknown_strategy)?;
            let mut merged = MergedDataSet::new().with_strategy(strategy);
            for provider in &providers {
                merged.add_data_set(Arc::clone(provider))?;
            }

            let mut bindings = Vec::with_capacity(fixture.bindings.len());
            for written in &fixture.bindings {
                if written.member.is_some() {
                    return Err(HarnessError::FixtureFormat(format!(
                        "{}: merge bindings cannot be scoped to a member",
                        fixture.case_id
                    )));
                }
                bindings.push(DataBinding::new(
                    written.value_type,
                    written.index,
                    written.path.clone(),
                ));
            }
            Ok((merged.into_ref(), bindings))
        }
    }
}

fn values_match(expected: &[Scalar], actual: &[Scalar]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(left, right)| left.semantic_eq(right))
}

fn compare_expected(
    expected: &FixtureExpected,
    actual: &[Option<Vec<Scalar>>],
) -> Result<(), String> {
    if let Some(row_count) = expected.row_count
        && row_count != actual.len()
    {
        return Err(format!(
            "row count mismatch: expected={row_count}, actual={}",
            actual.len()
        ));
    }

    let Some(expected_rows) = &expected.rows else {
        return Ok(());
    };
    if expected_rows.len() != actual.len() {
        return Err(format!(
            "row count mismatch: expected={}, actual={}",
            expected_rows.len(),
            actual.len()
        ));
    }

    for (ordinal, (want, got)) in expected_rows.iter().zip(actual).enumerate() {
        let matches = match (want, got) {
            (Some(want), Some(got)) => values_match(want, got),
            (None, None) => true,
            _ => false,
        };
        if !matches {
            return Err(format!(
                "row {ordinal} mismatch: expected={want:?}, actual={got:?}"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bindery::Scalar;

    use super::{
        FixtureExpected, FixtureOperation, HarnessError, compare_expected, parse_fixture,
    };

    const COMBINATORIAL: &str = r#"{
        "case_id": "inline_combinatorial",
        "operation": "join",
        "strategy": "combinatorial",
        "providers": [
            {"rows": [{"values": [{"kind": "int64", "value": 1}]}]},
            {"rows": [{"values": [{"kind": "utf8", "value": "a"}]}]}
        ],
        "bindings": [{"index": 0}, {"index": 1}],
        "expected": {"rows": [[{"kind": "int64", "value": 1}, {"kind": "utf8", "value": "a"}]]}
    }"#;

    #[test]
    fn parse_fixture_accepts_known_strategies() {
        let fixture = parse_fixture(COMBINATORIAL).expect("valid fixture");
        assert_eq!(fixture.operation, FixtureOperation::Join);
        assert_eq!(fixture.providers.len(), 2);
        assert!(fixture.include_dynamic_rows);
        assert!(fixture.policy.is_none());
    }

    #[test]
    fn parse_fixture_rejects_unknown_strategies_and_missing_expectations() {
        let unknown = COMBINATORIAL.replace("\"combinatorial\"", "\"zip\"");
        assert!(matches!(
            parse_fixture(&unknown),
            Err(HarnessError::FixtureFormat(_))
        ));

        let wrong_kind = COMBINATORIAL.replace("\"join\"", "\"merge\"");
        assert!(matches!(
            parse_fixture(&wrong_kind),
            Err(HarnessError::FixtureFormat(_))
        ));

        let no_expectation = r#"{
            "case_id": "x", "operation": "merge", "strategy": "union",
            "providers": [], "expected": {}
        }"#;
        assert!(matches!(
            parse_fixture(no_expectation),
            Err(HarnessError::FixtureFormat(_))
        ));

        assert!(matches!(parse_fixture("{"), Err(HarnessError::Json(_))));
    }

    #[test]
    fn compare_expected_reports_first_divergence() {
        let expected = FixtureExpected {
            rows: Some(vec![Some(vec![Scalar::Int64(1)]), None]),
            row_count: None,
        };
        assert!(compare_expected(&expected, &[Some(vec![Scalar::Int64(1)]), None]).is_ok());

        let err = compare_expected(&expected, &[Some(vec![Scalar::Int64(2)]), None])
            .expect_err("value differs");
        assert!(err.starts_with("row 0 mismatch"));

        let err = compare_expected(&expected, &[Some(vec![Scalar::Int64(1)])])
            .expect_err("length differs");
        assert!(err.contains("row count mismatch"));

        let counted = FixtureExpected {
            rows: None,
            row_count: Some(3),
        };
        assert!(compare_expected(&counted, &[None, None, None]).is_ok());
        assert!(compare_expected(&counted, &[]).is_err());
    }

    #[test]
    fn nan_values_compare_equal() {
        let expected = FixtureExpected {
            rows: Some(vec![Some(vec![Scalar::Float64(f64::NAN)])]),
            row_count: None,
        };
        assert!(compare_expected(&expected, &[Some(vec![Scalar::Float64(f64::NAN)])]).is_ok());
    }
}
