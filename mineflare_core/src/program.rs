//! Program metadata, invocation records and argument handling
//!
//! The registry persists a [`ProgramMetadata`] next to each program source;
//! every execution produces an [`InvocationRecord`] that moves through the
//! `PENDING → RUNNING → {SUCCEEDED, FAILED, CANCELLED}` lifecycle and never
//! changes once terminal.

use serde::{Deserialize, Serialize};

use crate::{
    Json,
    capability::CapabilitySet,
    error::{ErrorKind, ProgramError},
};

/// Validates a registry program name: non-empty, `[A-Za-z0-9_-]` only.
pub fn validate_program_name(name: &str) -> Result<(), ProgramError> {
    if name.is_empty() {
        return Err(ProgramError::invalid_argument("program name must not be empty"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(ProgramError::invalid_argument(format!(
            "invalid character {c:?} in program name {name:?}"
        )));
    }
    Ok(())
}

/// Persistent metadata for a registered program.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgramMetadata {
    pub name: String,
    pub version: String,
    pub capabilities: CapabilitySet,
    /// Default argument mapping, merged under invocation args.
    #[serde(default)]
    pub defaults: Json,
    /// Creation time, unix milliseconds.
    pub created: u64,
    /// Last update time, unix milliseconds.
    pub updated: u64,
}

/// The metadata half of an evaluated program definition. The run handler
/// itself stays inside the sandbox that evaluated the source.
#[derive(Debug, Clone, Default)]
pub struct ProgramDefinition {
    /// Absent for legacy sources that evaluate to a bare run handler.
    pub name: Option<String>,
    pub version: String,
    pub capabilities: CapabilitySet,
    pub defaults: Json,
}

/// Invocation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded | InvocationStatus::Failed | InvocationStatus::Cancelled
        )
    }
}

/// One end-to-end program execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub invocation_id: String,
    pub program_name: String,
    /// Arguments after merging program defaults under invocation overrides.
    pub args: Json,
    pub status: InvocationStatus,
    /// Unix milliseconds; zero until the runner starts.
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Per-invocation options supplied by the caller.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Whole-invocation timeout override in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Capability narrowing; the effective set is declared ∩ requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySet>,
    /// Seed for the per-invocation RNG. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Shallow merge: defaults first, invocation args override key by key.
pub fn merge_args(defaults: &Json, args: &Json) -> Json {
    let mut merged = serde_json::Map::new();
    if let Json::Object(map) = defaults {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    if let Json::Object(map) = args {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    Json::Object(merged)
}

/// Parses `key=value` pairs into a JSON object. Values are recognised as
/// booleans and numbers first, then as embedded JSON, and fall back to raw
/// strings.
pub fn parse_args<S: AsRef<str>>(pairs: &[S]) -> Result<Json, ProgramError> {
    let mut out = serde_json::Map::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, raw) = pair.split_once('=').ok_or_else(|| {
            ProgramError::invalid_argument(format!("expected key=value, got {pair:?}"))
        })?;
        if key.is_empty() {
            return Err(ProgramError::invalid_argument(format!(
                "empty key in argument {pair:?}"
            )));
        }
        out.insert(key.to_string(), parse_arg_value(raw));
    }
    Ok(Json::Object(out))
}

fn parse_arg_value(raw: &str) -> Json {
    match raw {
        "true" => return Json::Bool(true),
        "false" => return Json::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<f64>()
        && let Some(num) = serde_json::Number::from_f64(n)
    {
        return Json::Number(num);
    }
    if let Ok(v) = serde_json::from_str::<Json>(raw) {
        return v;
    }
    Json::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn program_names_are_restricted() {
        assert!(validate_program_name("tree-farm_2").is_ok());
        assert!(validate_program_name("").is_err());
        assert!(validate_program_name("bad name").is_err());
        assert!(validate_program_name("no/slash").is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(!InvocationStatus::Pending.is_terminal());
        assert!(!InvocationStatus::Running.is_terminal());
        assert!(InvocationStatus::Succeeded.is_terminal());
        assert!(InvocationStatus::Failed.is_terminal());
        assert!(InvocationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn merge_is_shallow_and_args_win() {
        let defaults = json!({"radius": 8, "block": "oak_log", "opts": {"a": 1}});
        let args = json!({"radius": 16, "opts": {"b": 2}});
        let merged = merge_args(&defaults, &args);
        assert_eq!(merged["radius"], 16);
        assert_eq!(merged["block"], "oak_log");
        assert_eq!(merged["opts"], json!({"b": 2}));
    }

    #[test]
    fn parse_args_recognises_scalars_before_json() {
        let parsed = parse_args(&[
            "count=5",
            "deep=true",
            "name=quarry",
            "target={\"x\":1,\"y\":64,\"z\":-3}",
        ])
        .unwrap();
        assert_eq!(parsed["count"], 5.0);
        assert_eq!(parsed["deep"], true);
        assert_eq!(parsed["name"], "quarry");
        assert_eq!(parsed["target"]["z"], -3);
    }

    #[test]
    fn parse_args_matches_json_parse_for_json_values() {
        let raw = r#"["a", 2, {"k": true}]"#;
        let parsed = parse_args(&[format!("v={raw}")]).unwrap();
        assert_eq!(parsed["v"], serde_json::from_str::<Json>(raw).unwrap());
    }

    #[test]
    fn parse_args_rejects_malformed_pairs() {
        assert!(parse_args(&["no-equals"]).is_err());
        assert!(parse_args(&["=value"]).is_err());
    }
}
