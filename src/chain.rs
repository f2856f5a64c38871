// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pipelined calls: a `DeferredValue` is the not-yet-executed result of a
// call, carrying every step needed to produce it. Passing one as an argument
// splices its steps in front of the new call, and the argument becomes a
// reference to the step that produces it.
//
// On the wire a reference is `{"$ref": <step index>}`.

use serde_json::{json, Value};

use crate::codec::{ChainPayload, ChainRow};
use crate::schema::TypeSpec;

pub const REF_KEY: &str = "$ref";

/// If `value` is a step reference, the step index it points at.
pub fn ref_index(value: &Value) -> Option<usize> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(REF_KEY)?.as_u64().map(|n| n as usize)
}

/// One argument of a step: a literal, or the result of an earlier step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepArg {
    Value(Value),
    Ref(usize),
}

impl StepArg {
    pub fn to_json(&self) -> Value {
        match self {
            StepArg::Value(v) => v.clone(),
            StepArg::Ref(i) => json!({ REF_KEY: i }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallStep {
    pub signature: String,
    pub method: String,
    pub args: Vec<StepArg>,
}

/// Ordered steps; each may only reference steps before it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallTable {
    steps: Vec<CallStep>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[CallStep] {
        &self.steps
    }

    /// Append a step and return its index.
    pub fn push(&mut self, step: CallStep) -> usize {
        self.steps.push(step);
        self.steps.len() - 1
    }

    /// Append all of `other`, shifting its references past the current
    /// steps. Returns the index of `other`'s last step.
    fn splice(&mut self, other: &CallTable) -> usize {
        let offset = self.steps.len();
        self.steps.extend(other.steps.iter().map(|s| CallStep {
            signature: s.signature.clone(),
            method: s.method.clone(),
            args: s
                .args
                .iter()
                .map(|a| match a {
                    StepArg::Ref(i) => StepArg::Ref(i + offset),
                    v => v.clone(),
                })
                .collect(),
        }));
        self.steps.len() - 1
    }

    pub fn to_payload(&self) -> ChainPayload {
        ChainPayload {
            table: self
                .steps
                .iter()
                .map(|s| {
                    ChainRow(
                        s.signature.clone(),
                        s.method.clone(),
                        s.args.iter().map(StepArg::to_json).collect(),
                    )
                })
                .collect(),
        }
    }
}

/// Placeholder for the result of a call that has not run yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredValue {
    signature: String,
    method: String,
    return_type: TypeSpec,
    table: CallTable,
}

impl DeferredValue {
    /// Build the deferred result of calling `method` with `args`, splicing
    /// in the steps of every deferred argument in argument order.
    ///
    /// A deferred value passed twice contributes its steps twice.
    pub fn from_call(signature: &str, method: &str, return_type: TypeSpec, args: Vec<Arg>) -> Self {
        let mut table = CallTable::new();
        let args = args
            .into_iter()
            .map(|a| match a {
                Arg::Immediate(v) => StepArg::Value(v),
                Arg::Deferred(d) => StepArg::Ref(table.splice(&d.table)),
            })
            .collect();
        table.push(CallStep {
            signature: signature.to_string(),
            method: method.to_string(),
            args,
        });
        Self {
            signature: signature.to_string(),
            method: method.to_string(),
            return_type,
            table,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn return_type(&self) -> &TypeSpec {
        &self.return_type
    }

    /// Every step needed to produce this value, ending with its own.
    pub fn table(&self) -> &CallTable {
        &self.table
    }
}

/// A call argument: a concrete value or a deferred one.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Immediate(Value),
    Deferred(DeferredValue),
}

impl Arg {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Arg::Deferred(_))
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Arg::Immediate(v)
    }
}

impl From<DeferredValue> for Arg {
    fn from(d: DeferredValue) -> Self {
        Arg::Deferred(d)
    }
}

impl From<&DeferredValue> for Arg {
    fn from(d: &DeferredValue) -> Self {
        Arg::Deferred(d.clone())
    }
}
