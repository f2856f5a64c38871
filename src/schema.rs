// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Structural types of capability methods and the capability spec returned by
// the daemon at registration.
//
// Type grammar (whitespace is ignored):
//
//   type := Null | Bool | Number | String | Any
//         | Array | Array<type>
//         | Object | Object<String, type>
//
// Bare `Array`/`Object` leave their elements unconstrained.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeSpec {
    Null,
    Bool,
    Number,
    String,
    Any,
    Array(Box<TypeSpec>),
    /// Keys are always strings; the box holds the value type.
    Object(Box<TypeSpec>),
}

impl TypeSpec {
    pub fn array(elem: TypeSpec) -> Self {
        TypeSpec::Array(Box::new(elem))
    }

    pub fn object(value: TypeSpec) -> Self {
        TypeSpec::Object(Box::new(value))
    }

    pub fn any() -> Self {
        TypeSpec::Any
    }

    /// Whether `value` conforms, checking every nested element.
    pub fn accepts(&self, value: &Value) -> bool {
        self.check(value).is_ok()
    }

    /// Like [`accepts`](Self::accepts) but explains the first violation.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        self.check_at(value, &mut String::new())
    }

    fn check_at(&self, value: &Value, path: &mut String) -> Result<(), String> {
        let ok = match (self, value) {
            (TypeSpec::Any, _) => true,
            (TypeSpec::Null, Value::Null) => true,
            (TypeSpec::Bool, Value::Bool(_)) => true,
            (TypeSpec::Number, Value::Number(_)) => true,
            (TypeSpec::String, Value::String(_)) => true,
            (TypeSpec::Array(elem), Value::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    elem.check_at(item, path)?;
                    path.truncate(len);
                }
                true
            }
            (TypeSpec::Object(val), Value::Object(map)) => {
                for (k, item) in map {
                    let len = path.len();
                    path.push_str(&format!(".{k}"));
                    val.check_at(item, path)?;
                    path.truncate(len);
                }
                true
            }
            _ => false,
        };
        if ok {
            return Ok(());
        }
        let at = if path.is_empty() {
            String::new()
        } else {
            format!(" at {path}")
        };
        Err(format!("expected {self}, found {}{at}", kind_of(value)))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Null => f.write_str("Null"),
            TypeSpec::Bool => f.write_str("Bool"),
            TypeSpec::Number => f.write_str("Number"),
            TypeSpec::String => f.write_str("String"),
            TypeSpec::Any => f.write_str("Any"),
            TypeSpec::Array(elem) => write!(f, "Array<{elem}>"),
            TypeSpec::Object(val) => write!(f, "Object<String, {val}>"),
        }
    }
}

impl From<TypeSpec> for String {
    fn from(t: TypeSpec) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for TypeSpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for TypeSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut p = Parser {
            src: &compact,
            pos: 0,
        };
        let t = p.parse_type()?;
        if p.pos != compact.len() {
            return Err(format!("trailing input in type {s:?}"));
        }
        Ok(t)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn ident(&mut self) -> &str {
        let rest = &self.src[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn eat(&mut self, c: char) -> bool {
        if self.src[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(format!("expected '{c}' at offset {} in {:?}", self.pos, self.src))
        }
    }

    fn parse_type(&mut self) -> Result<TypeSpec, String> {
        let name = self.ident().to_string();
        match name.as_str() {
            "Null" => Ok(TypeSpec::Null),
            "Bool" => Ok(TypeSpec::Bool),
            "Number" => Ok(TypeSpec::Number),
            "String" => Ok(TypeSpec::String),
            "Any" => Ok(TypeSpec::Any),
            "Array" => {
                if !self.eat('<') {
                    return Ok(TypeSpec::array(TypeSpec::Any));
                }
                let elem = self.parse_type()?;
                self.expect('>')?;
                Ok(TypeSpec::array(elem))
            }
            "Object" => {
                if !self.eat('<') {
                    return Ok(TypeSpec::object(TypeSpec::Any));
                }
                let key = self.parse_type()?;
                if key != TypeSpec::String {
                    return Err(format!("object keys must be String, not {key}"));
                }
                self.expect(',')?;
                let val = self.parse_type()?;
                self.expect('>')?;
                Ok(TypeSpec::object(val))
            }
            "" => Err(format!("expected a type at offset {} in {:?}", self.pos, self.src)),
            other => Err(format!("unknown type {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(rename = "returnType", default = "TypeSpec::any")]
    pub return_type: TypeSpec,
}

impl MethodSpec {
    pub fn returning(return_type: TypeSpec) -> Self {
        Self {
            args: Vec::new(),
            return_type,
        }
    }

    pub fn arg(mut self, name: &str, ty: TypeSpec) -> Self {
        self.args.push(ArgSpec {
            name: name.to_string(),
            ty,
        });
        self
    }
}

/// What the daemon returns for `REGISTER`. Immutable for the registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub signature: String,
    pub methods: BTreeMap<String, MethodSpec>,
}

impl CapabilitySpec {
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }
}
