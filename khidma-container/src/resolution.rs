//! The context one resolution runs in.
//!
//! A [`Resolution`] carries the chain of keys currently being built, the
//! scope (if any) scoped services come from, and values supplied to an
//! injected call. Async factories receive one and resolve through it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::container::Container;
use crate::error::{CyclicDependencyError, KhidmaError, Result};
use crate::key::ServiceKey;
use crate::lifetime::Lifetime;
use crate::registry::{AnyInstance, BoxFuture, downcast};
use crate::scope::Scope;

/// Arguments supplied explicitly to an injected call.
pub(crate) type Supplied = HashMap<ServiceKey, AnyInstance>;

/// Resolution context handed to factories.
///
/// ```
/// use std::sync::Arc;
/// use khidma_container::recipe::Recipe;
///
/// struct Settings { dsn: String }
/// struct Engine { dsn: String }
///
/// let recipe = Recipe::<Engine>::async_factory(|resolution| async move {
///     let settings = resolution.get::<Settings>().await?;
///     Ok(Arc::new(Engine { dsn: settings.dsn.clone() }))
/// });
/// ```
#[derive(Clone)]
pub struct Resolution {
    container: Container,
    scope: Option<Scope>,
    path: Vec<ServiceKey>,
    supplied: Option<Arc<Supplied>>,
    /// Shared by every context descended from one top-level call.
    owner: u64,
}

impl Resolution {
    pub(crate) fn root(container: Container, scope: Option<Scope>) -> Self {
        let owner = container.builds().next_owner();
        Self {
            container,
            scope,
            path: Vec::new(),
            supplied: None,
            owner,
        }
    }

    pub(crate) fn with_supplied(mut self, supplied: Arc<Supplied>) -> Self {
        self.supplied = Some(supplied);
        self
    }

    /// The scope scoped services are taken from. `None` while a singleton
    /// is being built.
    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    /// Keys under construction, outermost first.
    pub fn chain(&self) -> &[ServiceKey] {
        &self.path
    }

    /// Resolves `T` as a dependency of the service being built.
    pub async fn get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get_key::<T>(ServiceKey::of::<T>()).await
    }

    pub async fn get_named<T: ?Sized + Send + Sync + 'static>(&self, name: &'static str) -> Result<Arc<T>> {
        self.get_key::<T>(ServiceKey::named::<T>(name)).await
    }

    /// Like [`get`](Self::get), but `Ok(None)` when `T` is not registered.
    ///
    /// Other failures (a scoped `T` without scope, a failing factory) are
    /// still errors.
    pub async fn try_get<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        let key = ServiceKey::of::<T>();
        if !self.is_supplied(&key) && !self.container.contains_key(&key) {
            return Ok(None);
        }
        self.get_key::<T>(key).await.map(Some)
    }

    pub(crate) async fn get_key<T: ?Sized + Send + Sync + 'static>(&self, key: ServiceKey) -> Result<Arc<T>> {
        let instance = self.resolve_key(key.clone()).await?;
        downcast::<T>(&key, &instance)
    }

    /// Child context for building `key`'s dependencies.
    ///
    /// Supplied values only apply to the outermost call.
    pub(crate) fn descend(&self, key: &ServiceKey, scope: Option<Scope>) -> Resolution {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.extend(self.path.iter().cloned());
        path.push(key.clone());

        Resolution {
            container: self.container.clone(),
            scope,
            path,
            supplied: None,
            owner: self.owner,
        }
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    /// The chain without the key this context builds.
    pub(crate) fn outer_chain(&self) -> &[ServiceKey] {
        match self.path.split_last() {
            Some((_, outer)) => outer,
            None => &[],
        }
    }

    fn is_supplied(&self, key: &ServiceKey) -> bool {
        self.supplied.as_ref().is_some_and(|s| s.contains_key(key))
    }

    /// Resolves one key by its lifetime. Boxed because it recurses through
    /// factories.
    pub(crate) fn resolve_key(&self, key: ServiceKey) -> BoxFuture<'_, Result<AnyInstance>> {
        Box::pin(async move {
            if let Some(instance) = self.supplied.as_ref().and_then(|s| s.get(&key)) {
                trace!(key = %key, "Using supplied argument");
                return Ok(instance.clone());
            }

            let container = &self.container;
            if container.is_shut_down() {
                return Err(KhidmaError::ShutDown { key });
            }

            // Checked before any cache cell is touched: waiting on the cell of
            // a key this chain is itself building would never finish.
            if let Some(start) = self.path.iter().position(|k| *k == key) {
                let mut chain = self.path[start..].to_vec();
                chain.push(key);
                warn!(cycle = ?chain, "Cyclic dependency detected at runtime");
                return Err(KhidmaError::CyclicDependency(CyclicDependencyError { chain }));
            }

            let limit = container.options().max_resolution_depth;
            if self.path.len() >= limit {
                return Err(KhidmaError::ResolutionTooDeep { key, limit });
            }

            let Some(descriptor) = container.descriptor(&key) else {
                return Err(container.not_registered(key, self.path.last().cloned()));
            };

            trace!(
                key = %key,
                lifetime = %descriptor.lifetime,
                depth = self.path.len(),
                "Resolving"
            );

            match descriptor.lifetime {
                Lifetime::Singleton => {
                    container
                        .singleton(descriptor, self.descend(&key, None))
                        .await
                }
                Lifetime::Scoped => {
                    let Some(scope) = &self.scope else {
                        return Err(KhidmaError::no_active_scope(Some(key)));
                    };
                    scope
                        .scoped(descriptor, self.descend(&key, Some(scope.clone())))
                        .await
                }
                Lifetime::Transient => {
                    descriptor
                        .construct(self.descend(&key, self.scope.clone()))
                        .await
                }
            }
        })
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("chain", &self.path)
            .field("scope", &self.scope.as_ref().map(Scope::id))
            .field("supplied", &self.supplied.as_ref().map_or(0, |s| s.len()))
            .finish()
    }
}
