//! Action registry.
//!
//! A task names its action directly; the registry maps that name to the
//! handler supplied by the hosting application at startup. There is no
//! routing table and no reflection: an unregistered name is an unknown
//! action and the task is abandoned.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Handler for one action name.
///
/// Returning `Err` fails the attempt and hands the task to the retry
/// policy. Wrap the error in [`PermanentFailure`] to abandon the task
/// without further attempts.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, args: &Value) -> anyhow::Result<()>;
}

/// Marks an action error as not worth retrying.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PermanentFailure(pub String);

impl PermanentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Whether `err` (or anything in its cause chain) is a permanent failure.
    pub fn is_permanent(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| cause.is::<PermanentFailure>())
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Adapter so plain async closures can be registered.
struct FnAction<F> {
    f: F,
}

#[async_trait]
impl<F> TaskAction for FnAction<F>
where
    F: Fn(Value) -> BoxFuture + Send + Sync,
{
    async fn run(&self, args: &Value) -> anyhow::Result<()> {
        (self.f)(args.clone()).await
    }
}

/// Registry of actions, indexed by name.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn TaskAction>>,
}

impl ActionRegistry {
    /// Create an empty registry with no actions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register a handler. Names are unique; registering a name twice is a
    /// configuration error.
    pub fn register(&mut self, name: impl Into<String>, action: Arc<dyn TaskAction>) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Config("action name must not be empty".to_string()));
        }
        if self.actions.contains_key(&name) {
            return Err(Error::Config(format!("action {name} is already registered")));
        }
        self.actions.insert(name, action);
        Ok(())
    }

    /// Register an async closure taking the task's arguments.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed = move |args: Value| -> BoxFuture { Box::pin(f(args)) };
        self.register(name, Arc::new(FnAction { f: boxed }))
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskAction>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
