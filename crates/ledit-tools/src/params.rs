// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde_json::{json, Value};

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    Array,
    Object,
}

impl ParamType {
    fn json_name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "integer",
            ParamType::Float => "number",
            ParamType::Bool => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter of a registered tool.
#[derive(Debug, Clone)]
pub struct ParameterConfig {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    /// Alternate argument names accepted from the model.  Resolution order
    /// is primary name first, then aliases in declaration order.
    pub aliases: &'static [&'static str],
    pub description: &'static str,
}

impl ParameterConfig {
    pub fn required(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            param_type,
            required: true,
            aliases: &[],
            description,
        }
    }

    pub fn optional(name: &'static str, param_type: ParamType, description: &'static str) -> Self {
        Self {
            name,
            param_type,
            required: false,
            aliases: &[],
            description,
        }
    }

    pub fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }
}

/// Validated, coerced argument map handed to tool handlers.
///
/// Keys are the declared parameter names (aliases are resolved away);
/// unrecognized arguments from the model are dropped during validation.
#[derive(Debug, Clone, Default)]
pub struct ValidatedArgs {
    map: BTreeMap<String, Value>,
}

impl ValidatedArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.map.get(name).and_then(Value::as_i64)
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.map.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.map.get(name).and_then(Value::as_bool)
    }

    pub fn array(&self, name: &str) -> Option<&Vec<Value>> {
        self.map.get(name).and_then(Value::as_array)
    }
}

/// Validate `raw` (the parsed JSON argument object) against the declared
/// parameter list.
///
/// For each declared parameter the value is looked up by primary name and
/// then by each alias; required parameters must resolve; values are coerced
/// per the type matrix.  Arguments that match no declaration are ignored.
pub fn validate_args(
    params: &[ParameterConfig],
    raw: &Value,
) -> Result<ValidatedArgs, String> {
    let obj = match raw {
        Value::Object(m) => m,
        Value::Null => {
            // Missing arguments are equivalent to "{}"
            return check_required(params, &ValidatedArgs::default()).map(|_| ValidatedArgs::default());
        }
        other => return Err(format!("arguments must be a JSON object, got {other}")),
    };

    let mut out = ValidatedArgs::default();
    for p in params {
        let found = std::iter::once(p.name)
            .chain(p.aliases.iter().copied())
            .find_map(|key| obj.get(key));
        match found {
            Some(v) => {
                let coerced = coerce(p, v)?;
                out.map.insert(p.name.to_string(), coerced);
            }
            None if p.required => {
                return Err(format!("missing required parameter '{}'", p.name));
            }
            None => {}
        }
    }
    Ok(out)
}

fn check_required(params: &[ParameterConfig], args: &ValidatedArgs) -> Result<(), String> {
    for p in params {
        if p.required && args.get(p.name).is_none() {
            return Err(format!("missing required parameter '{}'", p.name));
        }
    }
    Ok(())
}

/// Coerce one argument value to the declared type.
///
/// - `string` accepts strings, numbers, and bools (rendered to text) and
///   objects/arrays (re-encoded as canonical JSON).
/// - `int` accepts integers and whole-valued floats.
/// - `float` accepts any number (and integers).
/// - `bool` is strict.
/// - `array` / `object` pass through unchanged.
fn coerce(p: &ParameterConfig, v: &Value) -> Result<Value, String> {
    match p.param_type {
        ParamType::String => match v {
            Value::String(_) => Ok(v.clone()),
            Value::Number(n) => Ok(json!(n.to_string())),
            Value::Bool(b) => Ok(json!(b.to_string())),
            Value::Object(_) | Value::Array(_) => {
                let encoded = serde_json::to_string(v)
                    .map_err(|e| format!("parameter '{}': {e}", p.name))?;
                Ok(json!(encoded))
            }
            Value::Null => Err(format!("parameter '{}' must be a string", p.name)),
        },
        ParamType::Int => match v {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(json!(i))
                } else if let Some(f) = n.as_f64() {
                    if f.fract() == 0.0 {
                        Ok(json!(f as i64))
                    } else {
                        Err(format!("parameter '{}' must be an integer, got {f}", p.name))
                    }
                } else {
                    Err(format!("parameter '{}' out of integer range", p.name))
                }
            }
            _ => Err(format!("parameter '{}' must be an integer", p.name)),
        },
        ParamType::Float => match v {
            Value::Number(n) => n
                .as_f64()
                .map(|f| json!(f))
                .ok_or_else(|| format!("parameter '{}' out of range", p.name)),
            _ => Err(format!("parameter '{}' must be a number", p.name)),
        },
        ParamType::Bool => match v {
            Value::Bool(_) => Ok(v.clone()),
            _ => Err(format!("parameter '{}' must be a boolean", p.name)),
        },
        ParamType::Array => match v {
            Value::Array(_) => Ok(v.clone()),
            _ => Err(format!("parameter '{}' must be an array", p.name)),
        },
        ParamType::Object => match v {
            Value::Object(_) => Ok(v.clone()),
            _ => Err(format!("parameter '{}' must be an object", p.name)),
        },
    }
}

/// Render a declared parameter list as the JSON Schema object handed to the
/// model in the tool catalog.
pub fn parameters_schema(params: &[ParameterConfig]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for p in params {
        properties.insert(
            p.name.to_string(),
            json!({
                "type": p.param_type.json_name(),
                "description": p.description,
            }),
        );
        if p.required {
            required.push(Value::String(p.name.to_string()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
