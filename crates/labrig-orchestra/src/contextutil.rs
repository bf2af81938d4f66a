//! Ordered setup/teardown composition.
//!
//! [`NestedScopes`] enters a list of scopes in order, runs a body with the
//! acquired values, then releases every entered scope in reverse order no
//! matter how the body ended. Release keeps going past individual release
//! failures; the error reported to the caller is the first one seen, from
//! acquisition, the body, or (only if those succeeded) the first failing
//! release.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type ScopeFactory<V, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<(V, Release<E>), E>> + Send>;

/// The teardown half of an entered scope.
pub struct Release<E> {
    action: Option<Box<dyn FnOnce() -> BoxFuture<'static, Result<(), E>> + Send>>,
}

impl<E: 'static> Release<E> {
    pub fn new<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Release {
            action: Some(Box::new(move || Box::pin(action()))),
        }
    }

    /// A scope with nothing to undo.
    pub fn noop() -> Self {
        Release { action: None }
    }

    async fn run(self) -> Result<(), E> {
        match self.action {
            Some(action) => action().await,
            None => Ok(()),
        }
    }
}

/// Called on the first acquisition or body failure when the operator asked
/// to inspect failures before teardown.
#[async_trait]
pub trait OperatorHook: Send + Sync {
    /// Returns once the operator is done; teardown starts afterwards.
    async fn inspect(&self, failure: &str);
}

/// Builder for an ordered stack of scopes.
pub struct NestedScopes<V, E> {
    scopes: Vec<(String, ScopeFactory<V, E>)>,
    hook: Option<Arc<dyn OperatorHook>>,
}

impl<V, E> Default for NestedScopes<V, E>
where
    V: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> NestedScopes<V, E>
where
    V: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        NestedScopes {
            scopes: Vec::new(),
            hook: None,
        }
    }

    /// Appends a scope. `factory` is not invoked until [`run`](Self::run)
    /// reaches it.
    pub fn scope<F, Fut>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(V, Release<E>), E>> + Send + 'static,
    {
        self.scopes
            .push((name.into(), Box::new(move || Box::pin(factory()))));
        self
    }

    /// Pauses on the first failure until `hook` returns.
    pub fn with_operator_hook(mut self, hook: Option<Arc<dyn OperatorHook>>) -> Self {
        self.hook = hook;
        self
    }

    /// Enters every scope, runs `body`, and unwinds.
    pub async fn run<B, Fut, R>(self, body: B) -> Result<R, E>
    where
        B: FnOnce(Vec<V>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let mut entered: Vec<(String, Release<E>)> = Vec::with_capacity(self.scopes.len());
        let mut values = Vec::with_capacity(self.scopes.len());
        let mut acquire_failure: Option<E> = None;

        for (name, factory) in self.scopes {
            match factory().await {
                Ok((value, release)) => {
                    tracing::debug!("entered scope {}", name);
                    values.push(value);
                    entered.push((name, release));
                }
                Err(err) => {
                    tracing::error!("Failed entering scope {}: {} ({:?})", name, err, err);
                    acquire_failure = Some(err);
                    break;
                }
            }
        }

        let mut outcome = match acquire_failure {
            Some(err) => Err(err),
            None => match body(values).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    tracing::error!("Saw failure inside nested scopes: {} ({:?})", err, err);
                    Err(err)
                }
            },
        };

        if let (Err(err), Some(hook)) = (&outcome, &self.hook) {
            tracing::warn!("Saw failure, waiting for operator before teardown...");
            hook.inspect(&err.to_string()).await;
        }

        while let Some((name, release)) = entered.pop() {
            if let Err(err) = release.run().await {
                tracing::error!("Failed releasing scope {}: {}", name, err);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        outcome
    }
}
