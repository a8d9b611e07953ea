//! Workflow definition parsing, validation, and file discovery.
//!
//! Converts YAML (or JSON, which YAML subsumes) documents into validated
//! `WorkflowDefinition`s and discovers definition files on disk so a runner
//! can publish them at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use synapse_types::correlation::ConsumptionMode;
use synapse_types::workflow::{ActionDefinition, StateDefinition, StateKind, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Id is non-empty and the version is a semantic version
/// - At least one state exists, state names are unique, `start` exists
/// - Every transition targets an existing state
/// - Every state either ends the workflow or declares where to go next
/// - Function and retry references resolve
/// - Each action calls exactly one function or sub-flow
/// - Listen filters agree with their consumption strategy
/// - Timeout > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if def.id.trim().is_empty() {
        return Err(invalid("workflow id must not be empty"));
    }
    semver::Version::parse(&def.version)
        .map_err(|e| invalid(format!("version '{}' is not a semantic version: {e}", def.version)))?;

    if def.states.is_empty() {
        return Err(invalid("workflow must have at least one state"));
    }

    let mut names = HashSet::new();
    for state in &def.states {
        if !names.insert(state.name.as_str()) {
            return Err(invalid(format!("duplicate state name: '{}'", state.name)));
        }
    }
    if !names.contains(def.start.as_str()) {
        return Err(invalid(format!("start state '{}' does not exist", def.start)));
    }

    let mut function_names = HashSet::new();
    for function in &def.functions {
        if !function_names.insert(function.name.as_str()) {
            return Err(invalid(format!("duplicate function name: '{}'", function.name)));
        }
    }

    for state in &def.states {
        validate_state(def, state, &names)?;
    }

    if def.timeout_secs == Some(0) {
        return Err(invalid("timeout must be > 0"));
    }

    Ok(())
}

fn check_target(state: &StateDefinition, target: &str, names: &HashSet<&str>) -> Result<(), DefinitionError> {
    if names.contains(target) {
        Ok(())
    } else {
        Err(invalid(format!(
            "state '{}' transitions to unknown state '{target}'",
            state.name
        )))
    }
}

fn validate_state(
    def: &WorkflowDefinition,
    state: &StateDefinition,
    names: &HashSet<&str>,
) -> Result<(), DefinitionError> {
    if let Some(target) = &state.transition {
        check_target(state, target, names)?;
    }
    for handler in &state.on_errors {
        match &handler.transition {
            Some(target) => check_target(state, target, names)?,
            None if handler.end => {}
            None => {
                return Err(invalid(format!(
                    "error handler '{}' of state '{}' neither transitions nor ends",
                    handler.error, state.name
                )));
            }
        }
    }

    let routes_itself = match &state.kind {
        StateKind::Switch {
            conditions,
            default_transition,
        } => {
            if conditions.is_empty() {
                return Err(invalid(format!("switch state '{}' has no conditions", state.name)));
            }
            for condition in conditions {
                match &condition.transition {
                    Some(target) => check_target(state, target, names)?,
                    None if condition.end => {}
                    None => {
                        return Err(invalid(format!(
                            "condition '{}' of switch state '{}' neither transitions nor ends",
                            condition.condition, state.name
                        )));
                    }
                }
            }
            if let Some(target) = default_transition {
                check_target(state, target, names)?;
            }
            default_transition.is_some()
        }
        StateKind::Operation { actions, .. } | StateKind::ForEach { actions, .. } => {
            if actions.is_empty() {
                return Err(invalid(format!("state '{}' has no actions", state.name)));
            }
            for action in actions {
                validate_action(def, state, action)?;
            }
            false
        }
        StateKind::Parallel { branches, .. } => {
            if branches.is_empty() {
                return Err(invalid(format!("parallel state '{}' has no branches", state.name)));
            }
            let mut branch_names = HashSet::new();
            for branch in branches {
                if !branch_names.insert(branch.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate branch '{}' in state '{}'",
                        branch.name, state.name
                    )));
                }
                for action in &branch.actions {
                    validate_action(def, state, action)?;
                }
            }
            false
        }
        StateKind::Listen { events, .. } => {
            if events.filters.is_empty() {
                return Err(invalid(format!("listen state '{}' has no event filters", state.name)));
            }
            if events.strategy == ConsumptionMode::One && events.filters.len() != 1 {
                return Err(invalid(format!(
                    "listen state '{}' uses strategy 'one' but declares {} filters",
                    state.name,
                    events.filters.len()
                )));
            }
            false
        }
        StateKind::Sleep { .. } | StateKind::Inject { .. } => false,
    };

    if !state.end && state.transition.is_none() && !routes_itself {
        // A switch whose every condition ends or transitions still needs a
        // fallback when none matches.
        return Err(invalid(format!(
            "state '{}' must either end the workflow or declare a transition",
            state.name
        )));
    }
    Ok(())
}

fn validate_action(
    def: &WorkflowDefinition,
    state: &StateDefinition,
    action: &ActionDefinition,
) -> Result<(), DefinitionError> {
    match (&action.function_ref, &action.sub_flow_ref) {
        (Some(function), None) => {
            if def.function(&function.ref_name).is_none() {
                return Err(invalid(format!(
                    "action '{}' in state '{}' references unknown function '{}'",
                    action.name, state.name, function.ref_name
                )));
            }
        }
        (None, Some(_)) => {}
        _ => {
            return Err(invalid(format!(
                "action '{}' in state '{}' must reference exactly one function or sub-flow",
                action.name, state.name
            )));
        }
    }
    if let Some(retry) = &action.retry_ref {
        if def.retry(retry).is_none() {
            return Err(invalid(format!(
                "action '{}' in state '{}' references unknown retry policy '{retry}'",
                action.name, state.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow definition files under `base_dir`.
///
/// Scans for `.yaml`, `.yml` and `.json` files recursively. Files that fail to
/// parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_definition = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json");
        if !is_definition {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping invalid workflow file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
