//! Provider entitlement enforcement for extension dispatch.
//!
//! Before a step is dispatched, its extension and any filesystem paths found
//! in its inputs are checked against the provider's entitlements. An empty
//! entitlement list is permissive.

use std::collections::BTreeMap;

use paws_types::workflow::Entitlement;
use serde_json::Value;

/// Input keys whose values are shell text, never paths.
const COMMAND_KEYS: &[&str] = &["command", "script"];

/// Substrings that mark a value as shell text rather than a path.
const SHELL_OPERATORS: &[&str] = &["|", "&&", ";", ">", "<", "$(", "`"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntitlementError {
    #[error("no entitlement grants capability for extension '{extension}'")]
    CapabilityDenied { extension: String },

    #[error("no entitlement scope covers path '{path}' for extension '{extension}'")]
    ScopeDenied { extension: String, path: String },
}

// ---------------------------------------------------------------------------
// EntitlementEnforcer
// ---------------------------------------------------------------------------

/// Checks dispatches against a provider's entitlement list.
#[derive(Debug, Clone, Copy)]
pub struct EntitlementEnforcer<'a> {
    entitlements: &'a [Entitlement],
}

impl<'a> EntitlementEnforcer<'a> {
    pub fn new(entitlements: &'a [Entitlement]) -> Self {
        Self { entitlements }
    }

    /// No entitlements declared: every dispatch is allowed.
    pub fn is_permissive(&self) -> bool {
        self.entitlements.is_empty()
    }

    /// Check one dispatch of `extension` with the given raw inputs.
    ///
    /// At least one entitlement must grant the extension, and every path in
    /// the inputs must fall within the scope of one of those entitlements.
    pub fn check(
        &self,
        extension: &str,
        tool: Option<&str>,
        inputs: &BTreeMap<String, Value>,
    ) -> Result<(), EntitlementError> {
        if self.is_permissive() {
            return Ok(());
        }

        let granting: Vec<&Entitlement> = self
            .entitlements
            .iter()
            .filter(|e| matches_capability(&e.capability, extension, tool))
            .collect();
        if granting.is_empty() {
            return Err(EntitlementError::CapabilityDenied {
                extension: extension.to_string(),
            });
        }

        for path in extract_paths(inputs) {
            if !granting.iter().any(|e| matches_scope(&e.scope, &path)) {
                return Err(EntitlementError::ScopeDenied {
                    extension: extension.to_string(),
                    path,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// `*`, or a capability naming the extension (or its tool), case-insensitively.
fn matches_capability(capability: &str, extension: &str, tool: Option<&str>) -> bool {
    let capability = capability.trim().to_lowercase();
    if capability == "*" {
        return true;
    }
    if capability.contains(&extension.to_lowercase()) {
        return true;
    }
    tool.is_some_and(|t| !t.is_empty() && capability.contains(&t.to_lowercase()))
}

/// `*` and `execute…` scopes cover any path. Otherwise the scope's last word
/// is a path prefix, e.g. `"Read ./data/"`.
fn matches_scope(scope: &str, path: &str) -> bool {
    let scope = scope.trim();
    if scope == "*" || scope.to_lowercase().starts_with("execute") {
        return true;
    }
    let Some(prefix) = scope.split_whitespace().last() else {
        return false;
    };
    if !looks_like_path(prefix) {
        return false;
    }
    let normalize = |p: &str| p.strip_prefix("./").unwrap_or(p).to_string();
    normalize(path).starts_with(&normalize(prefix))
}

// ---------------------------------------------------------------------------
// Path extraction
// ---------------------------------------------------------------------------

/// Collect every value in `inputs` that looks like a filesystem path.
///
/// `command` and `script` keys are skipped at any depth, as are URLs and
/// values containing shell operators.
pub fn extract_paths(inputs: &BTreeMap<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for (key, value) in inputs {
        collect_paths(key, value, &mut out);
    }
    out
}

fn collect_paths(key: &str, value: &Value, out: &mut Vec<String>) {
    if COMMAND_KEYS.contains(&key) {
        return;
    }
    match value {
        Value::String(s) => {
            if is_path_value(s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_paths(key, v, out)),
        Value::Object(map) => map.iter().for_each(|(k, v)| collect_paths(k, v, out)),
        _ => {}
    }
}

fn is_path_value(value: &str) -> bool {
    let value = value.trim();
    if value.contains("://") || SHELL_OPERATORS.iter().any(|op| value.contains(op)) {
        return false;
    }
    looks_like_path(value)
}

fn looks_like_path(value: &str) -> bool {
    value.starts_with('/')
        || value.starts_with('~')
        || value.starts_with("./")
        || value.starts_with("../")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
