use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use callite_core::{CallArgs, Value};
use dashmap::DashMap;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A callable exposed over RPC.
///
/// Receives the caller's positional and keyword arguments and returns a
/// plain value. An `Err` becomes an error response whose message is the
/// error's display text. Handlers never see transport details.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, args: CallArgs) -> anyhow::Result<Value>;
}

/// Adapts an async function or closure into a `Handler`.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: CallArgs) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

// ---------------------------------------------------------------------------
// MethodRegistry
// ---------------------------------------------------------------------------

/// A registered method: its handler and whether callers get a reply.
#[derive(Clone)]
pub struct RegisteredMethod {
    pub handler: Arc<dyn Handler>,
    /// `false` for subscribe-style methods: the result is discarded and
    /// nothing is ever published.
    pub returns: bool,
}

impl std::fmt::Debug for RegisteredMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// Method name -> handler table of one server.
///
/// Normally populated before traffic arrives, but registration is safe at
/// any time: workers clone the entry out and never hold a map lock across
/// a handler call.
#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, RegisteredMethod>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous entry.
    /// Returns the replaced entry.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        returns: bool,
    ) -> Option<RegisteredMethod> {
        let name = name.into();
        let previous = self
            .methods
            .insert(name.clone(), RegisteredMethod { handler, returns });
        if previous.is_some() {
            warn!(method = %name, "method re-registered, replacing previous handler");
        } else {
            debug!(method = %name, returns, "method registered");
        }
        previous
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<RegisteredMethod> {
        self.methods.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}
