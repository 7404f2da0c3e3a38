//! Action registry.
//!
//! Maps identifiers to descriptors. The registry is built once at startup
//! through [`RegistryBuilder`] and is immutable afterwards, so connection
//! tasks share it behind an `Arc` without locking.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use sbdots_ipc::is_valid_identifier;

use crate::error::{DaemonError, Result};
use crate::handler::ActionHandler;
use crate::supervisor::panic_message;

/// Builds a handler instance from the request arguments
pub type HandlerFactory =
    Arc<dyn Fn(&[String]) -> anyhow::Result<Arc<dyn ActionHandler>> + Send + Sync>;

/// How the daemon drives a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Runs to completion under a timeout; output becomes the reply
    OneShot,
    /// Streams status frames until stopped; one instance per handler type
    LongRunning,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneShot => write!(f, "one-shot"),
            Self::LongRunning => write!(f, "long-running"),
        }
    }
}

/// Handler type name expected for an identifier: `on_mpd_change` becomes
/// `OnMpdChange`.
#[must_use]
pub fn handler_type_name(identifier: &str) -> String {
    identifier
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ActionDescriptor {
    identifier: String,
    handler_type: String,
    mode: ExecutionMode,
    factory: HandlerFactory,
}

impl ActionDescriptor {
    pub fn new(
        identifier: impl Into<String>,
        handler_type: impl Into<String>,
        mode: ExecutionMode,
        factory: HandlerFactory,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            handler_type: handler_type.into(),
            mode,
            factory,
        }
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn handler_type(&self) -> &str {
        &self.handler_type
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    #[must_use]
    pub fn is_long_running(&self) -> bool {
        self.mode == ExecutionMode::LongRunning
    }

    /// Build a handler for one request.
    ///
    /// # Errors
    ///
    /// `HandlerInitFailed` when the factory returns an error or panics.
    pub fn instantiate(&self, args: &[String]) -> Result<Arc<dyn ActionHandler>> {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| (self.factory)(args)));
        let reason = match result {
            Ok(Ok(handler)) => return Ok(handler),
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };
        Err(DaemonError::HandlerInitFailed {
            handler: self.handler_type.clone(),
            reason,
        })
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("identifier", &self.identifier)
            .field("handler_type", &self.handler_type)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    actions: HashMap<String, ActionDescriptor>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// # Errors
    ///
    /// Rejects identifiers outside `[a-z0-9_]+` and duplicates.
    pub fn register(&mut self, descriptor: ActionDescriptor) -> Result<&mut Self> {
        let identifier = descriptor.identifier().to_string();
        if !is_valid_identifier(&identifier) {
            return Err(DaemonError::Registration(format!(
                "invalid action identifier '{identifier}'"
            )));
        }
        if self.actions.contains_key(&identifier) {
            return Err(DaemonError::Registration(format!(
                "action '{identifier}' is already registered"
            )));
        }
        self.actions.insert(identifier, descriptor);
        Ok(self)
    }

    /// Register a one-shot action whose handler type follows its identifier.
    ///
    /// # Errors
    ///
    /// See [`RegistryBuilder::register`].
    pub fn one_shot<F>(&mut self, identifier: &str, factory: F) -> Result<&mut Self>
    where
        F: Fn(&[String]) -> anyhow::Result<Arc<dyn ActionHandler>> + Send + Sync + 'static,
    {
        self.register(ActionDescriptor::new(
            identifier,
            handler_type_name(identifier),
            ExecutionMode::OneShot,
            Arc::new(factory),
        ))
    }

    /// Register a long-running action whose handler type follows its
    /// identifier.
    ///
    /// # Errors
    ///
    /// See [`RegistryBuilder::register`].
    pub fn long_running<F>(&mut self, identifier: &str, factory: F) -> Result<&mut Self>
    where
        F: Fn(&[String]) -> anyhow::Result<Arc<dyn ActionHandler>> + Send + Sync + 'static,
    {
        self.register(ActionDescriptor::new(
            identifier,
            handler_type_name(identifier),
            ExecutionMode::LongRunning,
            Arc::new(factory),
        ))
    }

    #[must_use]
    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            actions: self.actions,
        }
    }
}

#[derive(Debug)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionDescriptor>,
}

impl ActionRegistry {
    /// Registry with every built-in action.
    ///
    /// # Errors
    ///
    /// Only fails if a built-in registration is invalid.
    pub fn builtin() -> Result<Self> {
        let mut builder = RegistryBuilder::new();
        crate::actions::register_builtin(&mut builder)?;
        Ok(builder.build())
    }

    /// Find the descriptor for `identifier`.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` if the identifier is unknown, or if the registered
    /// handler type is not the one the identifier names.
    pub fn resolve(&self, identifier: &str) -> Result<&ActionDescriptor> {
        let Some(descriptor) = self.actions.get(identifier) else {
            return Err(DaemonError::HandlerNotFound(format!(
                "Unknown action '{identifier}'"
            )));
        };
        let expected = handler_type_name(identifier);
        if descriptor.handler_type() != expected {
            return Err(DaemonError::HandlerNotFound(format!(
                "No handler '{expected}' found for action '{identifier}'"
            )));
        }
        Ok(descriptor)
    }

    #[must_use]
    pub fn contains(&self, identifier: &str) -> bool {
        self.actions.contains_key(identifier)
    }

    /// Registered identifiers, sorted
    #[must_use]
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Descriptors sorted by identifier
    pub fn descriptors(&self) -> impl Iterator<Item = &ActionDescriptor> {
        let mut descriptors: Vec<&ActionDescriptor> = self.actions.values().collect();
        descriptors.sort_unstable_by(|a, b| a.identifier().cmp(b.identifier()));
        descriptors.into_iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
