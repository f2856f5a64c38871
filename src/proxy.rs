// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client-side handle for one registered capability.
//
// Methods are dispatched by name through `invoke`, against the method table
// the daemon returned at registration. Arguments are checked against the
// declared types before anything is encoded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chain::{Arg, DeferredValue};
use crate::codec::{encode_payload, CallPayload, Command, NamePayload};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::schema::{CapabilitySpec, MethodSpec};

/// How method calls on a proxy are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// `CALL` and wait for the reply.
    #[default]
    Sync,
    /// `ONE_WAY`; return without waiting.
    OneWay,
    /// Send nothing; return a `DeferredValue`.
    Lazy,
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    positional: Vec<Arg>,
    named: Vec<(String, Arg)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.positional.push(arg.into());
        self
    }

    pub fn named(mut self, name: &str, arg: impl Into<Arg>) -> Self {
        self.named.push((name.to_string(), arg.into()));
        self
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(values: Vec<Value>) -> Self {
        Self {
            positional: values.into_iter().map(Arg::Immediate).collect(),
            named: Vec::new(),
        }
    }
}

/// Outcome of `invoke`, depending on the mode and the arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Synchronous reply.
    Value(Value),
    /// One-way request queued; there is no reply.
    Dispatched,
    /// Nothing sent yet.
    Deferred(DeferredValue),
}

impl Invocation {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Invocation::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_deferred(self) -> Option<DeferredValue> {
        match self {
            Invocation::Deferred(d) => Some(d),
            _ => None,
        }
    }
}

struct Registration {
    name: String,
    spec: CapabilitySpec,
    connection: Arc<Connection>,
    dropped: AtomicBool,
}

/// A registered capability. Clones and `with_mode` handles share the
/// registration; unregistering through one invalidates all of them.
#[derive(Clone)]
pub struct CapabilityProxy {
    reg: Arc<Registration>,
    mode: Mode,
}

impl CapabilityProxy {
    /// Send `REGISTER{name}` and build a proxy from the returned spec.
    pub fn register(connection: Arc<Connection>, name: &str, mode: Mode) -> Result<Self> {
        let payload = encode_payload(&NamePayload {
            name: name.to_string(),
        })?;
        let timeout = connection.config().call_timeout;
        let value = match connection.call(Command::Register, payload, timeout) {
            Ok(v) => v,
            Err(Error::RemoteError(msg)) => {
                debug!(capability = name, %msg, "registration refused");
                return Err(Error::UnknownCapability(name.to_string()));
            }
            Err(e) => return Err(e),
        };
        let spec: CapabilitySpec = serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("bad capability spec for `{name}`: {e}")))?;
        info!(capability = name, signature = %spec.signature, methods = spec.methods.len(), "capability registered");
        Ok(Self {
            reg: Arc::new(Registration {
                name: name.to_string(),
                spec,
                connection,
                dropped: AtomicBool::new(false),
            }),
            mode,
        })
    }

    /// Another handle on the same registration with a different mode.
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            reg: Arc::clone(&self.reg),
            mode,
        }
    }

    pub fn name(&self) -> &str {
        &self.reg.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn spec(&self) -> &CapabilitySpec {
        &self.reg.spec
    }

    pub fn signature(&self) -> &str {
        &self.reg.spec.signature
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.reg.spec.methods.keys().map(String::as_str)
    }

    pub fn is_dropped(&self) -> bool {
        self.reg.dropped.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::CapabilityDropped(self.reg.name.clone()));
        }
        Ok(())
    }

    /// Call `method`. Any deferred argument makes the call deferred too,
    /// whatever the mode.
    pub fn invoke(&self, method: &str, args: CallArgs) -> Result<Invocation> {
        self.check_live()?;
        let decl = self.reg.spec.method(method).ok_or_else(|| Error::UnknownMethod {
            capability: self.reg.name.clone(),
            method: method.to_string(),
        })?;
        let args = resolve_args(method, decl, args)?;

        if self.mode == Mode::Lazy || args.iter().any(Arg::is_deferred) {
            return Ok(Invocation::Deferred(DeferredValue::from_call(
                self.signature(),
                method,
                decl.return_type.clone(),
                args,
            )));
        }

        let args = args
            .into_iter()
            .filter_map(|a| match a {
                Arg::Immediate(v) => Some(v),
                Arg::Deferred(_) => None,
            })
            .collect();
        let payload = encode_payload(&CallPayload {
            signature: self.signature().to_string(),
            method: method.to_string(),
            args,
        })?;
        let conn = &self.reg.connection;
        if self.mode == Mode::OneWay {
            conn.request(Command::OneWay, payload)?;
            return Ok(Invocation::Dispatched);
        }
        let value = conn.call(Command::Call, payload, conn.config().call_timeout)?;
        if let Err(reason) = decl.return_type.check(&value) {
            warn!(capability = %self.reg.name, method, %reason, "reply does not match declared return type");
        }
        Ok(Invocation::Value(value))
    }

    /// Run every step of `deferred` in one `CHAIN_CALL` and return the
    /// last step's result.
    pub fn execute(&self, deferred: &DeferredValue) -> Result<Value> {
        let sequence = self.execute_async(deferred)?;
        let conn = &self.reg.connection;
        conn.await_response(sequence, conn.config().call_timeout)
    }

    /// Send the `CHAIN_CALL` and return its sequence number; collect the
    /// result later with `Connection::await_response`.
    pub fn execute_async(&self, deferred: &DeferredValue) -> Result<u32> {
        self.check_live()?;
        let table = deferred.table();
        debug!(capability = %self.reg.name, steps = table.len(), "executing chain");
        let payload = encode_payload(&table.to_payload())?;
        self.reg.connection.request(Command::ChainCall, payload)
    }

    /// Send `UNREGISTER{name}` without waiting and invalidate every handle
    /// on this registration. Repeated calls do nothing. A full outbound queue
    /// is waited on for at most the drain timeout.
    pub fn unregister(&self) -> Result<()> {
        if self.reg.dropped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let payload = encode_payload(&NamePayload {
            name: self.reg.name.clone(),
        })?;
        let conn = &self.reg.connection;
        conn.request_within(Command::Unregister, payload, Some(conn.config().drain_timeout))?;
        info!(capability = %self.reg.name, "capability unregistered");
        Ok(())
    }
}

impl std::fmt::Debug for CapabilityProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityProxy")
            .field("name", &self.reg.name)
            .field("signature", &self.reg.spec.signature)
            .field("mode", &self.mode)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

fn mismatch(method: &str, argument: &str, reason: String) -> Error {
    Error::TypeMismatch {
        method: method.to_string(),
        argument: argument.to_string(),
        reason,
    }
}

/// Order `args` by the declared parameters and type-check the immediate
/// ones. Deferred arguments are accepted for any declared type.
fn resolve_args(method: &str, decl: &MethodSpec, args: CallArgs) -> Result<Vec<Arg>> {
    let CallArgs { positional, mut named } = args;
    if positional.len() > decl.args.len() {
        return Err(mismatch(
            method,
            &format!("#{}", decl.args.len()),
            format!("takes {} arguments, got {}", decl.args.len(), positional.len()),
        ));
    }

    let mut positional = positional.into_iter();
    let mut out = Vec::with_capacity(decl.args.len());
    for param in &decl.args {
        let by_name = named.iter().position(|(n, _)| *n == param.name);
        let arg = match (positional.next(), by_name) {
            (Some(_), Some(_)) => {
                return Err(mismatch(method, &param.name, "given both by position and by name".into()))
            }
            (Some(a), None) => a,
            (None, Some(i)) => named.remove(i).1,
            (None, None) => return Err(mismatch(method, &param.name, "missing".into())),
        };
        if let Arg::Immediate(v) = &arg {
            param.ty.check(v).map_err(|reason| mismatch(method, &param.name, reason))?;
        }
        out.push(arg);
    }

    if let Some((name, _)) = named.first() {
        return Err(mismatch(method, name, "unexpected keyword argument".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeSpec;
    use serde_json::json;

    fn decl() -> MethodSpec {
        MethodSpec::returning(TypeSpec::Null)
            .arg("ids", TypeSpec::array(TypeSpec::Number))
            .arg("label", TypeSpec::String)
    }

    fn values(args: Vec<Arg>) -> Vec<Value> {
        args.into_iter()
            .map(|a| match a {
                Arg::Immediate(v) => v,
                Arg::Deferred(_) => panic!("unexpected deferred"),
            })
            .collect()
    }

    fn reason(e: Error) -> (String, String) {
        match e {
            Error::TypeMismatch { argument, reason, .. } => (argument, reason),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn positional_then_keyword() {
        let args = CallArgs::new().arg(json!([1, 2, 3])).named("label", json!("x"));
        let out = resolve_args("m", &decl(), args).unwrap();
        assert_eq!(values(out), vec![json!([1, 2, 3]), json!("x")]);
    }

    #[test]
    fn keywords_in_any_order() {
        let args = CallArgs::new().named("label", json!("x")).named("ids", json!([]));
        let out = resolve_args("m", &decl(), args).unwrap();
        assert_eq!(values(out), vec![json!([]), json!("x")]);
    }

    #[test]
    fn object_rejected_for_array_of_number() {
        let args = CallArgs::new().arg(json!({"a": 1})).arg(json!("x"));
        let (arg, why) = reason(resolve_args("m", &decl(), args).unwrap_err());
        assert_eq!(arg, "ids");
        assert_eq!(why, "expected Array<Number>, found object");
    }

    #[test]
    fn missing_surplus_unknown_and_duplicate() {
        let (arg, _) = reason(resolve_args("m", &decl(), CallArgs::new().arg(json!([]))).unwrap_err());
        assert_eq!(arg, "label");

        let surplus = CallArgs::from(vec![json!([]), json!("x"), json!(1)]);
        assert!(reason(resolve_args("m", &decl(), surplus).unwrap_err()).1.contains("takes 2"));

        let unknown = CallArgs::from(vec![json!([]), json!("x")]).named("colour", json!(1));
        assert_eq!(reason(resolve_args("m", &decl(), unknown).unwrap_err()).0, "colour");

        let dup = CallArgs::new().arg(json!([])).named("ids", json!([]));
        assert_eq!(reason(resolve_args("m", &decl(), dup).unwrap_err()).0, "ids");
    }

    #[test]
    fn deferred_accepted_for_any_type() {
        let d = DeferredValue::from_call("sig", "names", TypeSpec::String, vec![]);
        let args = CallArgs::new().arg(d).arg(json!("x"));
        let out = resolve_args("m", &decl(), args).unwrap();
        assert!(out[0].is_deferred());
    }
}
