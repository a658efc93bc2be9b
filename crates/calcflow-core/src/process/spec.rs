// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative process contracts.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortSpec {
    pub name: String,
    pub required: bool,
}

/// An exit code a process type may finish with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitCodeSpec {
    pub code: i32,
    pub label: String,
    pub message: String,
}

/// Allowed inputs, outputs and exit codes of a process type.
///
/// Built once through [`ProcessSpec::builder`] and shared read-only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSpec {
    pub name: String,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub exit_codes: Vec<ExitCodeSpec>,
    /// Accept input keys that are not declared.
    pub dynamic_inputs: bool,
    pub dynamic_outputs: bool,
}

impl ProcessSpec {
    pub fn builder(name: impl Into<String>) -> ProcessSpecBuilder {
        ProcessSpecBuilder {
            spec: ProcessSpec {
                name: name.into(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                exit_codes: Vec::new(),
                dynamic_inputs: false,
                dynamic_outputs: false,
            },
        }
    }

    pub fn exit_code(&self, label: &str) -> Option<&ExitCodeSpec> {
        self.exit_codes.iter().find(|e| e.label == label)
    }

    pub fn exit_code_by_value(&self, code: i32) -> Option<&ExitCodeSpec> {
        self.exit_codes.iter().find(|e| e.code == code)
    }

    pub fn validate_inputs(&self, inputs: &Value) -> Result<()> {
        validate_ports("inputs", &self.inputs, self.dynamic_inputs, inputs)
    }

    pub fn validate_outputs(&self, outputs: &Value) -> Result<()> {
        validate_ports("outputs", &self.outputs, self.dynamic_outputs, outputs)
    }
}

fn validate_ports(kind: &str, ports: &[PortSpec], dynamic: bool, value: &Value) -> Result<()> {
    let empty = Map::new();
    let map = match value {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(CoreError::validation(
                kind,
                format!("expected an object, got {}", type_name(other)),
            ));
        }
    };

    for port in ports.iter().filter(|p| p.required) {
        if !map.contains_key(&port.name) {
            return Err(CoreError::validation(
                format!("{kind}.{}", port.name),
                "required port is missing",
            ));
        }
    }

    if !dynamic {
        for key in map.keys() {
            if !ports.iter().any(|p| &p.name == key) {
                return Err(CoreError::validation(
                    format!("{kind}.{key}"),
                    "port is not declared",
                ));
            }
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct ProcessSpecBuilder {
    spec: ProcessSpec,
}

impl ProcessSpecBuilder {
    pub fn input(mut self, name: impl Into<String>, required: bool) -> Self {
        self.spec.inputs.push(PortSpec {
            name: name.into(),
            required,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, required: bool) -> Self {
        self.spec.outputs.push(PortSpec {
            name: name.into(),
            required,
        });
        self
    }

    pub fn exit_code(
        mut self,
        code: i32,
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.spec.exit_codes.push(ExitCodeSpec {
            code,
            label: label.into(),
            message: message.into(),
        });
        self
    }

    pub fn dynamic_inputs(mut self) -> Self {
        self.spec.dynamic_inputs = true;
        self
    }

    pub fn dynamic_outputs(mut self) -> Self {
        self.spec.dynamic_outputs = true;
        self
    }

    pub fn build(self) -> Result<Arc<ProcessSpec>> {
        let spec = self.spec;
        if spec.name.trim().is_empty() {
            return Err(CoreError::validation("spec.name", "must not be empty"));
        }

        let mut seen = HashSet::new();
        for port in &spec.inputs {
            if !seen.insert(port.name.as_str()) {
                return Err(CoreError::validation(
                    format!("spec.inputs.{}", port.name),
                    "declared twice",
                ));
            }
        }
        let mut seen = HashSet::new();
        for port in &spec.outputs {
            if !seen.insert(port.name.as_str()) {
                return Err(CoreError::validation(
                    format!("spec.outputs.{}", port.name),
                    "declared twice",
                ));
            }
        }

        let mut codes = HashSet::new();
        let mut labels = HashSet::new();
        for exit in &spec.exit_codes {
            if exit.code <= 0 {
                return Err(CoreError::validation(
                    format!("spec.exit_codes.{}", exit.label),
                    "exit codes must be positive",
                ));
            }
            if !codes.insert(exit.code) || !labels.insert(exit.label.as_str()) {
                return Err(CoreError::validation(
                    format!("spec.exit_codes.{}", exit.label),
                    "exit code or label declared twice",
                ));
            }
        }

        Ok(Arc::new(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> Arc<ProcessSpec> {
        ProcessSpec::builder("arithmetic.add")
            .input("x", true)
            .input("y", false)
            .output("sum", true)
            .exit_code(300, "ERROR_NEGATIVE", "the sum is negative")
            .build()
            .unwrap()
    }

    #[test]
    fn test_validate_inputs() {
        let spec = spec();
        assert!(spec.validate_inputs(&json!({"x": 1})).is_ok());
        assert!(spec.validate_inputs(&json!({"x": 1, "y": 2})).is_ok());

        let err = spec.validate_inputs(&json!({"y": 2})).unwrap_err();
        assert!(err.to_string().contains("inputs.x"));

        let err = spec.validate_inputs(&json!({"x": 1, "z": 0})).unwrap_err();
        assert!(err.to_string().contains("inputs.z"));

        assert!(spec.validate_inputs(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_dynamic_inputs_accept_unknown_keys() {
        let spec = ProcessSpec::builder("open")
            .dynamic_inputs()
            .build()
            .unwrap();
        assert!(spec.validate_inputs(&json!({"anything": true})).is_ok());
        assert!(spec.validate_inputs(&Value::Null).is_ok());
    }

    #[test]
    fn test_validate_outputs() {
        let spec = spec();
        assert!(spec.validate_outputs(&json!({"sum": 3})).is_ok());
        assert!(spec.validate_outputs(&json!({})).is_err());
    }

    #[test]
    fn test_exit_code_lookup() {
        let spec = spec();
        assert_eq!(spec.exit_code("ERROR_NEGATIVE").unwrap().code, 300);
        assert_eq!(
            spec.exit_code_by_value(300).unwrap().label,
            "ERROR_NEGATIVE"
        );
        assert!(spec.exit_code("nope").is_none());
    }

    #[test]
    fn test_build_rejects_duplicates() {
        assert!(
            ProcessSpec::builder("dup")
                .input("x", true)
                .input("x", false)
                .build()
                .is_err()
        );
        assert!(
            ProcessSpec::builder("dup")
                .exit_code(300, "A", "a")
                .exit_code(300, "B", "b")
                .build()
                .is_err()
        );
        assert!(
            ProcessSpec::builder("zero")
                .exit_code(0, "OK", "ok")
                .build()
                .is_err()
        );
        assert!(ProcessSpec::builder(" ").build().is_err());
    }
}
