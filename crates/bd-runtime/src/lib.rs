#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    #[default]
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    BindingFailure,
    RowCap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: GenerationIssue,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedger {
    records: Vec<DecisionRecord>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one issue kind, in decision order.
    pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &DecisionRecord> + '_ {
        self.records
            .iter()
            .filter(move |record| record.issue.kind == kind)
    }
}

/// How row generation reacts to rows that cannot be bound and to row
/// streams longer than the configured cap.
///
/// Strict mode fails on the first problem. Hardened mode skips rows that
/// fail to bind and truncates at the cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    pub include_dynamic_rows: bool,
    pub row_cap: Option<usize>,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            include_dynamic_rows: true,
            row_cap: None,
        }
    }

    #[must_use]
    pub fn hardened(row_cap: Option<usize>) -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            include_dynamic_rows: true,
            row_cap,
        }
    }

    #[must_use]
    pub fn with_dynamic_rows(mut self, include_dynamic_rows: bool) -> Self {
        self.include_dynamic_rows = include_dynamic_rows;
        self
    }

    /// Parses a policy from JSON. Missing fields take their strict defaults.
    pub fn from_json_str(input: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn decide_binding_failure(
        &self,
        subject: impl Into<String>,
        detail: impl Into<String>,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let action = match self.mode {
            RuntimeMode::Strict => DecisionAction::Reject,
            RuntimeMode::Hardened => DecisionAction::Repair,
        };
        let issue = GenerationIssue {
            kind: IssueKind::BindingFailure,
            subject: subject.into(),
            detail: detail.into(),
        };
        record(self.mode, action, issue, ledger)
    }

    /// Consulted once `produced` rows have been accepted and another row is
    /// available. Under the cap nothing is recorded.
    pub fn decide_row_cap(&self, produced: usize, ledger: &mut EvidenceLedger) -> DecisionAction {
        let Some(cap) = self.row_cap.filter(|cap| produced >= *cap) else {
            return DecisionAction::Allow;
        };

        let action = match self.mode {
            RuntimeMode::Strict => DecisionAction::Reject,
            RuntimeMode::Hardened => DecisionAction::Repair,
        };
        let issue = GenerationIssue {
            kind: IssueKind::RowCap,
            subject: "row_generator".to_owned(),
            detail: format!("row_cap={cap}, produced={produced}"),
        };
        record(self.mode, action, issue, ledger)
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("invalid runtime policy: {0}")]
    Policy(#[from] serde_json::Error),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(u64::try_from(ms).unwrap_or(u64::MAX))
}

fn record(
    mode: RuntimeMode,
    action: DecisionAction,
    issue: GenerationIssue,
    ledger: &mut EvidenceLedger,
) -> DecisionAction {
    ledger.push(DecisionRecord {
        ts_unix_ms: now_unix_ms().unwrap_or_default(),
        mode,
        action,
        issue,
    });
    action
}
