//! Plain data shared between the analyzers, the synthesizer and the runner.
//! Everything here is produced fresh per run and serializes to JSON for the
//! `facts`/`permutations`/`run --format json` outputs.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

/// Compute a coverage percentage, returning 100.0 when there is nothing to
/// cover. Rounded to two decimals.
#[must_use]
pub fn percent(covered: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (covered as f64 / total as f64 * 10_000.0).round() / 100.0
    }
}

/// Kind of a conditional branch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    If,
    Unless,
    Case,
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchKind::If => "if",
            BranchKind::Unless => "unless",
            BranchKind::Case => "case",
        })
    }
}

/// One `if`/`unless`/`case` site found in compiled source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    pub kind: BranchKind,
    /// Source text of the condition (the subject for `case`).
    pub condition: String,
    /// Identifiers read by the condition, de-duplicated in first-seen order.
    pub identifiers: Vec<String>,
    pub line: u32,
    pub site_id: u32,
}

/// Literal `when` values recorded for one `case` subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFact {
    pub subject: String,
    pub values: Vec<String>,
}

/// A conditional inside an `each` block that tests the loop variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConditionalFact {
    pub iterator: String,
    pub variable: String,
    /// Method suffixes called on the loop variable, e.g. `in_stock?`.
    pub conditions: Vec<String>,
}

impl BlockConditionalFact {
    /// Permutation keys for this block, e.g. `@products.__block_item__.in_stock?`.
    pub fn paths(&self) -> impl Iterator<Item = String> + '_ {
        self.conditions
            .iter()
            .map(move |method| block_item_path(&self.iterator, method))
    }
}

/// Marker segment separating an iterator from the item method in block paths.
pub const BLOCK_ITEM: &str = "__block_item__";

#[must_use]
pub fn block_item_path(iterator: &str, method: &str) -> String {
    format!("{iterator}.{BLOCK_ITEM}.{method}")
}

/// A variable assigned from a non-trivial expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedVariableFact {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// Literal strings an identifier is compared against with `==`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringComparisonFact {
    pub subject: String,
    pub values: Vec<String>,
}

/// Everything the structural analyzer recovers from one template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralFacts {
    pub case_facts: Vec<CaseFact>,
    pub block_facts: Vec<BlockConditionalFact>,
    pub computed_variables: Vec<ComputedVariableFact>,
    pub string_comparisons: Vec<StringComparisonFact>,
}

impl StructuralFacts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.case_facts.is_empty()
            && self.block_facts.is_empty()
            && self.computed_variables.is_empty()
            && self.string_comparisons.is_empty()
    }
}

/// Value realised for a `case` subject that matches no recorded `when`.
pub const UNMATCHED: &str = "__unmatched__";
/// Value realised for a string-comparison subject that matches no literal.
pub const NO_MATCH: &str = "__no_match__";

/// A value forced onto one identifier by a permutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForcedValue {
    Bool(bool),
    Str(String),
    /// Symbol literal, stored without its leading colon.
    Symbol(String),
    Unmatched,
}

impl ForcedValue {
    /// Interpret a recorded `when`/comparison literal: `:name` is a symbol,
    /// anything else a string.
    #[must_use]
    pub fn from_literal(literal: &str) -> Self {
        match literal.strip_prefix(':') {
            Some(name) if is_symbol_name(name) => ForcedValue::Symbol(name.to_string()),
            _ => ForcedValue::Str(literal.to_string()),
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ForcedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn is_symbol_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && name
            .trim_end_matches(['?', '!'])
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
}

impl fmt::Display for ForcedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForcedValue::Bool(b) => write!(f, "{b}"),
            ForcedValue::Str(s) => write!(f, "{s:?}"),
            ForcedValue::Symbol(s) => write!(f, ":{s}"),
            ForcedValue::Unmatched => f.write_str(UNMATCHED),
        }
    }
}

impl Serialize for ForcedValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ForcedValue::Bool(b) => serializer.serialize_bool(*b),
            ForcedValue::Str(s) => serializer.serialize_str(s),
            ForcedValue::Symbol(s) => serializer.serialize_str(&format!(":{s}")),
            ForcedValue::Unmatched => serializer.serialize_str(UNMATCHED),
        }
    }
}

impl<'de> Deserialize<'de> for ForcedValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => ForcedValue::Bool(b),
            Raw::Str(s) if s == UNMATCHED => ForcedValue::Unmatched,
            Raw::Str(s) => ForcedValue::from_literal(&s),
        })
    }
}

/// One complete assignment of forced values, ordered by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permutation(BTreeMap<String, ForcedValue>);

impl Permutation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ForcedValue) {
        self.0.insert(key.into(), value);
    }

    /// Copy of `self` with one key replaced.
    #[must_use]
    pub fn with(&self, key: &str, value: ForcedValue) -> Self {
        let mut next = self.clone();
        next.insert(key, value);
        next
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ForcedValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ForcedValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ForcedValue)> for Permutation {
    fn from_iter<I: IntoIterator<Item = (String, ForcedValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Permutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}")
    }
}

/// Which arm of a branch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmKind {
    Then,
    Else,
    /// The n-th `when` clause of a `case`, zero-based.
    When(u32),
}

impl fmt::Display for ArmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArmKind::Then => f.write_str("then"),
            ArmKind::Else => f.write_str("else"),
            ArmKind::When(i) => write!(f, "when[{i}]"),
        }
    }
}

/// Merged hit count for one branch arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmHit {
    pub site_id: u32,
    pub arm_id: u32,
    pub line: u32,
    pub kind: BranchKind,
    pub arm: ArmKind,
    pub hits: u64,
}

/// A branch arm that no permutation took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncoveredBranch {
    pub line: u32,
    pub kind: BranchKind,
    pub arm: ArmKind,
    pub site_id: u32,
    pub arm_id: u32,
}

/// Merged line and branch coverage for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub line_coverage: f64,
    pub branch_coverage: f64,
    pub total_lines: u64,
    pub covered_lines: u64,
    pub total_branches: u64,
    pub covered_branches: u64,
    pub uncovered_lines: Vec<u32>,
    pub uncovered_branches: Vec<UncoveredBranch>,
}

impl Default for CoverageSummary {
    /// The zeroed summary reported when nothing could be executed.
    fn default() -> Self {
        Self {
            line_coverage: 0.0,
            branch_coverage: 0.0,
            total_lines: 0,
            covered_lines: 0,
            total_branches: 0,
            covered_branches: 0,
            uncovered_lines: Vec::new(),
            uncovered_branches: Vec::new(),
        }
    }
}

/// What happened when one permutation was rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RenderOutcome {
    Rendered { output: String },
    Failed { error: RenderError },
}

/// One entry per executed permutation, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationOutput {
    pub permutation: Permutation,
    #[serde(flatten)]
    pub outcome: RenderOutcome,
}

impl PermutationOutput {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RenderOutcome::Rendered { .. })
    }
}

/// The complete result of one coverage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    pub source_path: Option<String>,
    pub compiled_path: Option<String>,
    pub outputs: Vec<PermutationOutput>,
    pub summary: CoverageSummary,
    /// Merged hits per executable line.
    pub line_hits: BTreeMap<u32, u64>,
    pub arm_hits: Vec<ArmHit>,
    pub branches: Vec<ConditionalBranch>,
    pub facts: StructuralFacts,
    /// Whether the isolated executor failed and coverage was zeroed.
    pub degraded: bool,
}

impl CoverageResult {
    #[must_use]
    pub fn permutation_count(&self) -> usize {
        self.outputs.len()
    }

    #[must_use]
    pub fn failed_outputs(&self) -> usize {
        self.outputs.iter().filter(|o| !o.is_success()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_empty_is_full() {
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn test_percent_rounds() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(2, 3), 66.67);
    }

    #[test]
    fn test_forced_value_from_literal() {
        assert_eq!(
            ForcedValue::from_literal(":active"),
            ForcedValue::Symbol("active".into())
        );
        assert_eq!(
            ForcedValue::from_literal("active"),
            ForcedValue::Str("active".into())
        );
        assert_eq!(ForcedValue::from_literal(":"), ForcedValue::Str(":".into()));
    }

    #[test]
    fn test_permutation_json_shape() {
        let mut perm = Permutation::new();
        perm.insert("admin?", ForcedValue::Bool(true));
        perm.insert("status", ForcedValue::Unmatched);
        perm.insert("kind", ForcedValue::Symbol("draft".into()));
        let json = serde_json::to_string(&perm).unwrap();
        assert_eq!(
            json,
            r#"{"admin?":true,"kind":":draft","status":"__unmatched__"}"#
        );
        let back: Permutation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, perm);
    }

    #[test]
    fn test_output_json_is_tagged() {
        let out = PermutationOutput {
            permutation: Permutation::new(),
            outcome: RenderOutcome::Rendered {
                output: "hi".into(),
            },
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["status"], "rendered");
        assert_eq!(json["output"], "hi");
    }
}
