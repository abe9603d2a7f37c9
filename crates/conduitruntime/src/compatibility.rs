//! Structural compatibility between a producer's output schema and a
//! consumer's input schema.
//!
//! The check walks every field the target declares. Required fields are
//! mapped when the source can supply them, either directly or through a cast
//! (string <-> number, string <-> boolean). Optional fields are type-checked
//! but never mapped. Source fields the target does not declare at all are
//! reported as informational `extra_field` issues.
//!
//! Scoring starts at 100 and deducts 40 per missing required field, 40 per
//! incompatible type and 10 per castable type. `full` means a perfect score,
//! anything under 50 is `incompatible`.

use crate::registry::SchemaCatalog;
use chrono::{DateTime, Utc};
use conduitcore::{FieldSpec, FieldType, Flow, FlowError, NodeConnection, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

const MISSING_FIELD_PENALTY: i32 = 40;
const TYPE_ERROR_PENALTY: i32 = 40;
const TYPE_WARNING_PENALTY: i32 = 10;
const INCOMPATIBLE_BELOW: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibilityLevel {
    Full,
    Partial,
    Incompatible,
}

impl CompatibilityLevel {
    pub fn from_score(score: u8) -> Self {
        if score == 100 {
            CompatibilityLevel::Full
        } else if score < INCOMPATIBLE_BELOW {
            CompatibilityLevel::Incompatible
        } else {
            CompatibilityLevel::Partial
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transformation {
    None,
    Cast,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub source_field: String,
    pub target_field: String,
    pub transformation: Transformation,
}

impl FieldMapping {
    fn new(field: &str, transformation: Transformation) -> Self {
        Self {
            source_field: field.to_string(),
            target_field: field.to_string(),
            transformation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingField,
    TypeMismatch,
    ExtraField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub field: String,
    pub severity: Severity,
    pub message: String,
}

impl CompatibilityIssue {
    fn new(kind: IssueKind, severity: Severity, field: &str, message: String) -> Self {
        Self {
            kind,
            field: field.to_string(),
            severity,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityResult {
    pub level: CompatibilityLevel,
    pub score: u8,
    pub mappings: Vec<FieldMapping>,
    pub issues: Vec<CompatibilityIssue>,
    pub transformation_required: bool,
}

impl CompatibilityResult {
    fn from_findings(mappings: Vec<FieldMapping>, issues: Vec<CompatibilityIssue>) -> Self {
        let penalty: i32 = issues
            .iter()
            .map(|issue| match (issue.kind, issue.severity) {
                (IssueKind::MissingField, _) => MISSING_FIELD_PENALTY,
                (IssueKind::TypeMismatch, Severity::Error) => TYPE_ERROR_PENALTY,
                (IssueKind::TypeMismatch, Severity::Warning) => TYPE_WARNING_PENALTY,
                _ => 0,
            })
            .sum();
        let score = (100 - penalty).clamp(0, 100) as u8;
        let level = CompatibilityLevel::from_score(score);
        let transformation_required = level != CompatibilityLevel::Incompatible
            && mappings
                .iter()
                .any(|m| m.transformation != Transformation::None);

        Self {
            level,
            score,
            mappings,
            issues,
            transformation_required,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.level != CompatibilityLevel::Incompatible
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &CompatibilityIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

/// Compare a producer's output schema against a consumer's input schema.
/// Pure and deterministic: schemas are ordered maps, so mappings and issues
/// always come out in field-name order.
pub fn check_schema_compatibility(source: &Schema, target: &Schema) -> CompatibilityResult {
    let mut mappings = Vec::new();
    let mut issues = Vec::new();

    for (name, wanted) in target {
        let Some(offered) = source.get(name) else {
            if wanted.required {
                issues.push(CompatibilityIssue::new(
                    IssueKind::MissingField,
                    Severity::Error,
                    name,
                    format!("Required field '{}' is not provided by the source", name),
                ));
            }
            continue;
        };

        if offered.field_type.matches(wanted.field_type) {
            if wanted.required {
                mappings.push(FieldMapping::new(name, Transformation::None));
            }
        } else if offered.field_type.castable_to(wanted.field_type) {
            if wanted.required {
                mappings.push(FieldMapping::new(name, Transformation::Cast));
            }
            issues.push(CompatibilityIssue::new(
                IssueKind::TypeMismatch,
                Severity::Warning,
                name,
                format!(
                    "Field '{}' will be cast from {} to {}",
                    name, offered.field_type, wanted.field_type
                ),
            ));
        } else {
            issues.push(CompatibilityIssue::new(
                IssueKind::TypeMismatch,
                Severity::Error,
                name,
                format!(
                    "Field '{}' is {} but {} is expected",
                    name, offered.field_type, wanted.field_type
                ),
            ));
        }
    }

    for name in source.keys().filter(|name| !target.contains_key(*name)) {
        issues.push(CompatibilityIssue::new(
            IssueKind::ExtraField,
            Severity::Info,
            name,
            format!("{} not used", name),
        ));
    }

    CompatibilityResult::from_findings(mappings, issues)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixMetadata {
    pub total_nodes: usize,
    pub total_pairs: usize,
    pub full: usize,
    pub partial: usize,
    pub incompatible: usize,
    pub generated_at: DateTime<Utc>,
}

/// Pairwise compatibility, indexed as `matrix[source][target]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityMatrix {
    pub nodes: Vec<String>,
    pub matrix: BTreeMap<String, BTreeMap<String, CompatibilityResult>>,
    pub metadata: MatrixMetadata,
}

impl CompatibilityMatrix {
    pub fn get(&self, source: &str, target: &str) -> Option<&CompatibilityResult> {
        self.matrix.get(source).and_then(|row| row.get(target))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    FieldMapping,
    DataTransformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationSuggestion {
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    pub source_field: Option<String>,
    pub target_field: String,
    pub transformation: Transformation,
    pub description: String,
}

/// Compatibility of one connection in a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub connection: NodeConnection,
    pub source_type: String,
    pub target_type: String,
    /// Whole-schema check between the two node types
    pub result: CompatibilityResult,
    /// Problems with the specific ports the connection binds
    pub port_issues: Vec<CompatibilityIssue>,
}

impl ConnectionReport {
    pub fn has_errors(&self) -> bool {
        self.port_issues
            .iter()
            .any(|i| i.severity == Severity::Error)
    }
}

/// Authoring-time compatibility checks backed by declared node schemas.
/// Informational only; nothing here blocks a flow from running.
pub struct CompatibilityValidator {
    catalog: Arc<dyn SchemaCatalog>,
}

impl CompatibilityValidator {
    pub fn new(catalog: Arc<dyn SchemaCatalog>) -> Self {
        Self { catalog }
    }

    fn schemas(&self, source_type: &str, target_type: &str) -> Result<(&Schema, &Schema), FlowError> {
        let output = self
            .catalog
            .output_schema(source_type)
            .ok_or_else(|| FlowError::NodeTypeNotFound(source_type.to_string()))?;
        let input = self
            .catalog
            .input_schema(target_type)
            .ok_or_else(|| FlowError::NodeTypeNotFound(target_type.to_string()))?;
        Ok((output, input))
    }

    /// Check whether `source_type`'s output can feed `target_type`'s input
    pub fn check(&self, source_type: &str, target_type: &str) -> Result<CompatibilityResult, FlowError> {
        let (output, input) = self.schemas(source_type, target_type)?;
        Ok(check_schema_compatibility(output, input))
    }

    /// Run the check for every ordered pair of distinct node types
    pub fn generate_matrix(&self, node_types: &[String]) -> Result<CompatibilityMatrix, FlowError> {
        let mut matrix = BTreeMap::new();
        let (mut full, mut partial, mut incompatible) = (0, 0, 0);

        for source in node_types {
            let mut row = BTreeMap::new();
            for target in node_types.iter().filter(|t| *t != source) {
                let result = self.check(source, target)?;
                match result.level {
                    CompatibilityLevel::Full => full += 1,
                    CompatibilityLevel::Partial => partial += 1,
                    CompatibilityLevel::Incompatible => incompatible += 1,
                }
                row.insert(target.clone(), result);
            }
            matrix.insert(source.clone(), row);
        }

        tracing::debug!(nodes = node_types.len(), full, partial, incompatible, "Generated compatibility matrix");

        Ok(CompatibilityMatrix {
            nodes: node_types.to_vec(),
            matrix,
            metadata: MatrixMetadata {
                total_nodes: node_types.len(),
                total_pairs: full + partial + incompatible,
                full,
                partial,
                incompatible,
                generated_at: Utc::now(),
            },
        })
    }

    /// Turn the check between two node types into actionable suggestions
    pub fn suggest_transformations(
        &self,
        source_type: &str,
        target_type: &str,
    ) -> Result<Vec<TransformationSuggestion>, FlowError> {
        let (output, input) = self.schemas(source_type, target_type)?;
        let result = check_schema_compatibility(output, input);
        Ok(suggestions_for(&result, output, input))
    }

    /// Check every connection of a flow against the declared schemas
    pub fn check_flow(&self, flow: &Flow) -> Result<Vec<ConnectionReport>, FlowError> {
        flow.connections
            .iter()
            .map(|conn| {
                let source_type = node_type_of(flow, &conn.from_node_id)?;
                let target_type = node_type_of(flow, &conn.to_node_id)?;
                let (output, input) = self.schemas(source_type, target_type)?;

                Ok(ConnectionReport {
                    connection: conn.clone(),
                    source_type: source_type.to_string(),
                    target_type: target_type.to_string(),
                    result: check_schema_compatibility(output, input),
                    port_issues: port_issues(conn, source_type, output, target_type, input),
                })
            })
            .collect()
    }
}

fn node_type_of<'a>(flow: &'a Flow, node_id: &str) -> Result<&'a str, FlowError> {
    flow.find_node(node_id)
        .map(|n| n.node_type.as_str())
        .ok_or_else(|| conduitcore::DefinitionError::NodeNotFound(node_id.to_string()).into())
}

fn port_issues(
    conn: &NodeConnection,
    source_type: &str,
    output: &Schema,
    target_type: &str,
    input: &Schema,
) -> Vec<CompatibilityIssue> {
    let mut issues = Vec::new();
    let offered = output.get(&conn.from_output);
    let wanted = input.get(&conn.to_input);

    if offered.is_none() {
        issues.push(CompatibilityIssue::new(
            IssueKind::MissingField,
            Severity::Error,
            &conn.from_output,
            format!("'{}' does not declare output '{}'", source_type, conn.from_output),
        ));
    }
    if wanted.is_none() {
        issues.push(CompatibilityIssue::new(
            IssueKind::ExtraField,
            Severity::Warning,
            &conn.to_input,
            format!("'{}' does not declare input '{}'", target_type, conn.to_input),
        ));
    }

    if let (Some(offered), Some(wanted)) = (offered, wanted) {
        if offered.field_type.matches(wanted.field_type) {
            return issues;
        }
        let severity = if offered.field_type.castable_to(wanted.field_type) {
            Severity::Warning
        } else {
            Severity::Error
        };
        issues.push(CompatibilityIssue::new(
            IssueKind::TypeMismatch,
            severity,
            &conn.to_input,
            format!(
                "{}.{} is {} but {}.{} expects {}",
                conn.from_node_id,
                conn.from_output,
                offered.field_type,
                conn.to_node_id,
                conn.to_input,
                wanted.field_type
            ),
        ));
    }

    issues
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Pick an unused source field that could stand in for a missing target
/// field: a name that matches after normalisation, otherwise the single
/// type-compatible candidate if there is exactly one.
fn rename_candidate<'a>(
    target_field: &str,
    wanted: &FieldSpec,
    source: &'a Schema,
    target: &Schema,
    taken: &HashSet<String>,
) -> Option<(&'a str, &'a FieldSpec)> {
    let free: Vec<(&String, &FieldSpec)> = source
        .iter()
        .filter(|(name, _)| !target.contains_key(*name) && !taken.contains(*name))
        .collect();

    let wanted_name = normalize(target_field);
    if let Some((name, spec)) = free.iter().find(|(name, _)| normalize(name) == wanted_name) {
        return Some((name.as_str(), *spec));
    }

    let typed: Vec<_> = free
        .iter()
        .filter(|(_, spec)| {
            spec.field_type.matches(wanted.field_type) || spec.field_type.castable_to(wanted.field_type)
        })
        .collect();
    match typed.as_slice() {
        [(name, spec)] => Some((name.as_str(), *spec)),
        _ => None,
    }
}

fn suggestions_for(
    result: &CompatibilityResult,
    source: &Schema,
    target: &Schema,
) -> Vec<TransformationSuggestion> {
    let mut suggestions = Vec::new();
    let mut taken = HashSet::new();

    for mapping in result
        .mappings
        .iter()
        .filter(|m| m.transformation == Transformation::Cast)
    {
        let from = source.get(&mapping.source_field).map(|s| s.field_type);
        let to = target.get(&mapping.target_field).map(|s| s.field_type);
        suggestions.push(TransformationSuggestion {
            kind: SuggestionKind::FieldMapping,
            source_field: Some(mapping.source_field.clone()),
            target_field: mapping.target_field.clone(),
            transformation: Transformation::Cast,
            description: format!(
                "Cast '{}' from {} to {}",
                mapping.source_field,
                from.unwrap_or(FieldType::Any),
                to.unwrap_or(FieldType::Any)
            ),
        });
    }

    for issue in &result.issues {
        match (issue.kind, issue.severity) {
            (IssueKind::MissingField, _) => {
                let Some(wanted) = target.get(&issue.field) else {
                    continue;
                };
                match rename_candidate(&issue.field, wanted, source, target, &taken) {
                    Some((candidate, spec)) => {
                        taken.insert(candidate.to_string());
                        let transformation = if spec.field_type.matches(wanted.field_type) {
                            Transformation::None
                        } else {
                            Transformation::Cast
                        };
                        suggestions.push(TransformationSuggestion {
                            kind: SuggestionKind::FieldMapping,
                            source_field: Some(candidate.to_string()),
                            target_field: issue.field.clone(),
                            transformation,
                            description: format!("Map '{}' to '{}'", candidate, issue.field),
                        });
                    }
                    None => suggestions.push(TransformationSuggestion {
                        kind: SuggestionKind::DataTransformation,
                        source_field: None,
                        target_field: issue.field.clone(),
                        transformation: Transformation::Custom,
                        description: format!(
                            "Provide a custom function that produces '{}' ({})",
                            issue.field, wanted.field_type
                        ),
                    }),
                }
            }
            (IssueKind::TypeMismatch, Severity::Error) => {
                let from = source.get(&issue.field).map(|s| s.field_type).unwrap_or(FieldType::Any);
                let to = target.get(&issue.field).map(|s| s.field_type).unwrap_or(FieldType::Any);
                suggestions.push(TransformationSuggestion {
                    kind: SuggestionKind::DataTransformation,
                    source_field: Some(issue.field.clone()),
                    target_field: issue.field.clone(),
                    transformation: Transformation::Custom,
                    description: format!(
                        "Convert '{}' from {} to {} with a custom function",
                        issue.field, from, to
                    ),
                });
            }
            _ => {}
        }
    }

    suggestions
}
