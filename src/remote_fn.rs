//! Running a program's own functions as remote tasks.
//!
//! A program registers handlers in a [`FunctionRegistry`] at startup and
//! calls [`FunctionRegistry::dispatch`] with its arguments before doing
//! anything else. A task whose argument string comes from
//! [`encode_invocation`] re-enters the same binary on the worker, and
//! `dispatch` runs the named handler instead of the normal program.

use std::collections::HashMap;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RemoteFnError;

/// First argument that marks a process as a remote function invocation.
pub const INVOCATION_MARKER: &str = "__BATCH__";

type Handler = Box<dyn Fn(&[u8]) -> Result<(), RemoteFnError> + Send + Sync>;

/// Named handlers callable through a remote invocation.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Its argument is decoded from JSON.
    pub fn register<A, F, E>(&mut self, name: &str, handler: F) -> Result<(), RemoteFnError>
    where
        A: DeserializeOwned,
        F: Fn(A) -> Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(RemoteFnError::Malformed(format!(
                "function name {:?} must be non-empty without whitespace",
                name
            )));
        }
        if self.handlers.contains_key(name) {
            return Err(RemoteFnError::Duplicate(name.to_string()));
        }

        let owned = name.to_string();
        self.handlers.insert(
            name.to_string(),
            Box::new(move |raw: &[u8]| {
                let args: A = serde_json::from_slice(raw).map_err(RemoteFnError::Decode)?;
                handler(args).map_err(|e| RemoteFnError::Failed {
                    name: owned.clone(),
                    message: e.to_string(),
                })
            }),
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Call a handler with hex-encoded JSON arguments.
    pub fn call(&self, name: &str, encoded: &str) -> Result<(), RemoteFnError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| RemoteFnError::UnknownFunction(name.to_string()))?;
        let raw = hex::decode(encoded).map_err(|e| RemoteFnError::Malformed(e.to_string()))?;
        handler(&raw)
    }

    /// Inspect process arguments (including the program name) and run the
    /// requested handler. Returns `None` when this is not an invocation.
    pub fn dispatch<I>(&self, argv: I) -> Option<Result<(), RemoteFnError>>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = argv.into_iter().skip(1);
        if args.next().as_deref() != Some(INVOCATION_MARKER) {
            return None;
        }
        let outcome = match (args.next(), args.next()) {
            (Some(name), Some(encoded)) => self.call(&name, &encoded),
            _ => Err(RemoteFnError::Malformed(
                "expected a function name and encoded arguments".to_string(),
            )),
        };
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Remote function invocation failed");
        }
        Some(outcome)
    }
}

/// Argument string that makes the program run `name` with `args`.
pub fn encode_invocation<A: Serialize>(name: &str, args: &A) -> Result<String, RemoteFnError> {
    let raw = serde_json::to_vec(args).map_err(RemoteFnError::Encode)?;
    Ok(format!("{} {} {}", INVOCATION_MARKER, name, hex::encode(raw)))
}
