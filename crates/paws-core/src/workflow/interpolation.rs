//! `{{id.key}}` interpolation against the execution context.
//!
//! References resolve to a recorded step output field, a loop counter
//! (`{{loop_id.counter}}`), or one of the reserved pseudo-ids
//! `user_inputs.prompt` and `provider.name` / `provider.<context key>`.
//! Unlike template rendering elsewhere, an unknown reference is an error,
//! never left as-is.

use serde_json::Value;

use super::context::ExecutionContext;

/// Reserved pseudo-id for the original request.
pub const USER_INPUTS_ID: &str = "user_inputs";

/// Reserved pseudo-id for the provider section.
pub const PROVIDER_ID: &str = "provider";

/// Key under which a loop exposes its counter.
pub const COUNTER_KEY: &str = "counter";

/// Errors raised while resolving a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpolationError {
    /// The referenced step has not completed or never recorded the key.
    #[error("unresolved reference '{{{{{reference}}}}}'")]
    Unresolved { reference: String },

    #[error("malformed reference in '{template}': {reason}")]
    Malformed { template: String, reason: String },
}

/// A parsed `{{id.key}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub id: String,
    pub key: String,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.id, self.key)
    }
}

/// A piece of a template: literal text or a reference.
enum Segment<'a> {
    Text(&'a str),
    Ref(Reference),
}

fn segments(template: &str) -> Result<Vec<Segment<'_>>, InterpolationError> {
    let mut out = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(InterpolationError::Malformed {
                template: template.to_string(),
                reason: "unterminated '{{'".to_string(),
            });
        };

        let inner = after[..end].trim();
        let Some((id, key)) = inner.split_once('.') else {
            return Err(InterpolationError::Malformed {
                template: template.to_string(),
                reason: format!("'{inner}' is not of the form id.key"),
            });
        };
        let (id, key) = (id.trim(), key.trim());
        if id.is_empty() || key.is_empty() {
            return Err(InterpolationError::Malformed {
                template: template.to_string(),
                reason: format!("'{inner}' has an empty id or key"),
            });
        }

        out.push(Segment::Ref(Reference {
            id: id.to_string(),
            key: key.to_string(),
        }));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// List every reference in a template, in order of appearance.
pub fn references(template: &str) -> Result<Vec<Reference>, InterpolationError> {
    Ok(segments(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Text(_) => None,
        })
        .collect())
}

/// Replace every reference in `template` with its current value.
pub fn resolve(template: &str, ctx: &ExecutionContext) -> Result<String, InterpolationError> {
    let mut out = String::with_capacity(template.len());
    for segment in segments(template)? {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Ref(r) => {
                let value = ctx
                    .lookup(&r.id, &r.key)
                    .ok_or_else(|| InterpolationError::Unresolved {
                        reference: r.to_string(),
                    })?;
                out.push_str(&value);
            }
        }
    }
    Ok(out)
}

/// Resolve one raw input value into the string form sent to an extension.
///
/// Strings are interpolated, scalars rendered as text, `null` as the empty
/// string. Lists and maps are interpolated leaf by leaf and rendered as
/// compact JSON.
pub fn resolve_input(value: &Value, ctx: &ExecutionContext) -> Result<String, InterpolationError> {
    match value {
        Value::String(s) => resolve(s, ctx),
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(_) | Value::Object(_) => {
            let resolved = resolve_tree(value, ctx)?;
            Ok(serde_json::to_string(&resolved).unwrap_or_default())
        }
    }
}

fn resolve_tree(value: &Value, ctx: &ExecutionContext) -> Result<Value, InterpolationError> {
    Ok(match value {
        Value::String(s) => Value::String(resolve(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_tree(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_tree(v, ctx)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Collect every string leaf of a raw input value.
pub fn input_templates(value: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    collect_templates(value, &mut out);
    out
}

fn collect_templates<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_templates(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_templates(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
