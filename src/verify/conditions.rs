//
// Copyright 2025 The Sigstore Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Conditions applied to the predicate of a verified attestation.
//!
//! The predicate is layered on top of the variable context, so that
//! `{{ repo.branch }}` refers to the `repo.branch` field of the predicate.

use std::str::FromStr;

use serde_json::Value;
use tracing::debug;

use super::wildcard;
use crate::context::{DataOverlay, VariableContext};
use crate::errors::{ImageGuardError, Result};
use crate::policy::{AnyAllConditions, Condition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    AnyIn,
    AllIn,
    NotIn,
    AnyNotIn,
    AllNotIn,
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,
}

impl FromStr for ConditionOperator {
    type Err = ImageGuardError;

    fn from_str(s: &str) -> Result<Self> {
        use ConditionOperator::*;

        Ok(match s {
            "Equal" | "Equals" => Equals,
            "NotEqual" | "NotEquals" => NotEquals,
            "In" => In,
            "AnyIn" => AnyIn,
            "AllIn" => AllIn,
            "NotIn" => NotIn,
            "AnyNotIn" => AnyNotIn,
            "AllNotIn" => AllNotIn,
            "GreaterThan" => GreaterThan,
            "GreaterThanOrEquals" => GreaterThanOrEquals,
            "LessThan" => LessThan,
            "LessThanOrEquals" => LessThanOrEquals,
            other => return Err(ImageGuardError::UnknownConditionOperator(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledCondition {
    key: Value,
    operator: ConditionOperator,
    value: Value,
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> Result<Self> {
        Ok(CompiledCondition {
            key: condition.key.clone(),
            operator: condition.operator.parse()?,
            value: condition.value.clone(),
        })
    }

    /// A variable missing from the predicate makes the condition false:
    /// the predicate is untrusted input, not configuration.
    fn evaluate(&self, ctx: &dyn VariableContext) -> Result<bool> {
        let (key, value) = match (ctx.substitute(&self.key), ctx.substitute(&self.value)) {
            (Ok(key), Ok(value)) => (key, value),
            (Err(ImageGuardError::UnresolvedVariable(path)), _)
            | (_, Err(ImageGuardError::UnresolvedVariable(path))) => {
                debug!(%path, "condition references a missing field");
                return Ok(false);
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };
        let result = apply(self.operator, &key, &value)?;
        debug!(?key, operator = ?self.operator, ?value, result, "condition evaluated");
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct CompiledBlock {
    any: Vec<CompiledCondition>,
    all: Vec<CompiledCondition>,
}

/// Conditions checked once the operators are known to be valid.
///
/// Compiling before any registry I/O makes an unknown operator a
/// configuration error even when no attestation reaches the conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    blocks: Vec<CompiledBlock>,
}

impl Conditions {
    pub fn compile(blocks: &[AnyAllConditions]) -> Result<Self> {
        let blocks = blocks
            .iter()
            .map(|b| {
                Ok(CompiledBlock {
                    any: b.any.iter().map(CompiledCondition::compile).collect::<Result<_>>()?,
                    all: b.all.iter().map(CompiledCondition::compile).collect::<Result<_>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Conditions { blocks })
    }

    /// `true` when every block holds for `predicate`: all of its `all`
    /// conditions and, when there are some, at least one of its `any`
    /// conditions.
    pub fn evaluate(&self, predicate: &Value, context: &dyn VariableContext) -> Result<bool> {
        let overlay = DataOverlay::new(predicate, context);

        for block in &self.blocks {
            for condition in &block.all {
                if !condition.evaluate(&overlay)? {
                    return Ok(false);
                }
            }
            if !block.any.is_empty() {
                let mut satisfied = false;
                for condition in &block.any {
                    if condition.evaluate(&overlay)? {
                        satisfied = true;
                        break;
                    }
                }
                if !satisfied {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn equals(key: &Value, value: &Value) -> Result<bool> {
    match (key, value) {
        (Value::String(k), Value::String(v)) => wildcard::matches(v, k),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            Ok(matches!((as_number(key), as_number(value)), (Some(k), Some(v)) if k == v))
        }
        (Value::Bool(k), Value::String(v)) | (Value::String(v), Value::Bool(k)) => {
            Ok(v.parse::<bool>().is_ok_and(|v| v == *k))
        }
        _ => Ok(key == value),
    }
}

fn as_set(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn contains(set: &[&Value], item: &Value) -> Result<bool> {
    for candidate in set {
        if equals(item, candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn count_in(key: &Value, value: &Value) -> Result<(usize, usize)> {
    let set = as_set(value);
    let items = as_set(key);
    let mut found = 0;
    for item in &items {
        if contains(&set, item)? {
            found += 1;
        }
    }
    Ok((found, items.len()))
}

fn compare(key: &Value, value: &Value, op: ConditionOperator) -> bool {
    let (Some(k), Some(v)) = (as_number(key), as_number(value)) else {
        debug!(?key, ?value, "values cannot be compared as numbers");
        return false;
    };
    match op {
        ConditionOperator::GreaterThan => k > v,
        ConditionOperator::GreaterThanOrEquals => k >= v,
        ConditionOperator::LessThan => k < v,
        _ => k <= v,
    }
}

fn apply(op: ConditionOperator, key: &Value, value: &Value) -> Result<bool> {
    use ConditionOperator::*;

    Ok(match op {
        Equals => equals(key, value)?,
        NotEquals => !equals(key, value)?,
        In | AllIn => {
            let (found, total) = count_in(key, value)?;
            total > 0 && found == total
        }
        NotIn => {
            let (found, total) = count_in(key, value)?;
            !(total > 0 && found == total)
        }
        AnyIn => count_in(key, value)?.0 > 0,
        AnyNotIn => {
            let (found, total) = count_in(key, value)?;
            found < total
        }
        AllNotIn => count_in(key, value)?.0 == 0,
        GreaterThan | GreaterThanOrEquals | LessThan | LessThanOrEquals => {
            compare(key, value, op)
        }
    })
}
