//! Handler registry: maps job class names to handler constructors.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::job::Job;
use crate::events::HookFlow;
use crate::models::{RusqueError, RusqueResult};

/// Errors handlers may return. Hosts can surface any error type; the runtime
/// records its display form in the failure envelope.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A job handler resolved by class name.
///
/// `set_up` and `tear_down` are optional bracketing steps; `set_up` may return
/// [`HookFlow::DontPerform`] to skip the job cleanly.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn set_up(&self, _job: &Job) -> Result<HookFlow, HandlerError> {
        Ok(HookFlow::Continue)
    }

    async fn perform(&self, job: &Job) -> Result<(), HandlerError>;

    async fn tear_down(&self, _job: &Job) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Constructor invoked once per reserved job to build a fresh handler.
pub type HandlerFactory = Box<dyn Fn() -> Box<dyn JobHandler> + Send + Sync>;

/// Registry of handler constructors, populated at process init.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under given class name. Replaces any previous
    /// registration for the same name.
    pub fn register<S, F, H>(&mut self, class: S, factory: F)
    where
        S: Into<String>,
        F: Fn() -> H + Send + Sync + 'static,
        H: JobHandler + 'static,
    {
        self.factories
            .insert(class.into(), Box::new(move || Box::new(factory())));
    }

    /// Build a handler for given class name.
    pub fn resolve(&self, class: &str) -> RusqueResult<Box<dyn JobHandler>> {
        match self.factories.get(class) {
            Some(factory) => Ok(factory()),
            None => Err(RusqueError::HandlerNotFound(class.to_string())),
        }
    }

    /// Whether a handler is registered under given class name.
    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }
}
