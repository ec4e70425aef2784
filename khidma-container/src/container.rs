//! # The Container
//!
//! Registration happens on a [`ContainerBuilder`]; `build()` validates the
//! declared graph and freezes it into a [`Container`].
//!
//! # Architecture
//! ```text
//! ContainerBuilder  ──build()──>  Container ──create_scope()──> Scope
//!                                    │                            │
//!                               singletons                 scoped instances
//!                                                         (disposed with it)
//! ```
//!
//! # Examples
//! ```rust
//! use khidma_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".into()
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut builder = Container::builder();
//! builder.register_singleton(Recipe::<dyn Greeter>::instance(Arc::new(English)))?;
//! let container = builder.build()?;
//!
//! let greeter = container.resolve::<dyn Greeter>().await?;
//! assert_eq!(greeter.greet(), "hello");
//! # Ok::<(), KhidmaError>(())
//! # }).unwrap();
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::error::{DisposalError, DisposalFailure, KhidmaError, NotRegisteredError, Result};
use crate::graph::{DependencyInfo, GraphValidator};
use crate::inflight::{BuildTracker, Slot};
use crate::injector::Injector;
use crate::key::ServiceKey;
use crate::lifetime::Lifetime;
use crate::options::ContainerOptions;
use crate::provider::Provider;
use crate::recipe::Recipe;
use crate::registry::{AnyInstance, Descriptor, Registry, similar_keys};
use crate::resolution::Resolution;
use crate::scope::Scope;

// ============================================================
// ContainerBuilder
// ============================================================

/// Collects registrations for a [`Container`].
///
/// Every register call fails fast on a duplicate key, so mistakes show up
/// where they are made:
///
/// ```rust
/// use khidma_container::prelude::*;
///
/// let mut builder = Container::builder();
/// builder.register_singleton(Recipe::value(String::from("postgres://localhost")))?;
///
/// let again = builder.register_singleton(Recipe::value(String::new()));
/// assert!(again.is_err());
/// # Ok::<(), KhidmaError>(())
/// ```
#[derive(Debug, Default)]
pub struct ContainerBuilder {
    registry: Registry,
    options: ContainerOptions,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(&mut self, options: ContainerOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Registers `recipe` under its key with `lifetime`.
    ///
    /// # Errors
    /// - [`KhidmaError::DuplicateRegistration`]: the key is taken
    /// - [`KhidmaError::InstanceRequiresSingleton`]: a pre-built instance
    ///   with a non-singleton lifetime
    pub fn register<T>(&mut self, lifetime: Lifetime, recipe: Recipe<T>) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let descriptor = recipe.into_descriptor(lifetime)?;
        self.registry.register(descriptor)?;
        Ok(self)
    }

    pub fn register_singleton<T>(&mut self, recipe: Recipe<T>) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(Lifetime::Singleton, recipe)
    }

    pub fn register_scoped<T>(&mut self, recipe: Recipe<T>) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(Lifetime::Scoped, recipe)
    }

    pub fn register_transient<T>(&mut self, recipe: Recipe<T>) -> Result<&mut Self>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(Lifetime::Transient, recipe)
    }

    /// Applies a [`Provider`] module.
    pub fn add_provider(&mut self, provider: &dyn Provider) -> Result<&mut Self> {
        debug!(provider = provider.name(), "Applying provider");
        provider.register(self)?;
        Ok(self)
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.registry.contains(&ServiceKey::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Builds the container.
    ///
    /// With `validate_on_build` (the default) the declared graph is checked
    /// first: every required dependency registered, no cycles, no singleton
    /// reaching a scoped service.
    #[instrument(skip(self), name = "container_build")]
    pub fn build(self) -> Result<Container> {
        info!(registered = self.registry.len(), "Building container");

        if self.options.validate_on_build {
            let infos = self
                .registry
                .descriptors()
                .map(|descriptor| {
                    (
                        descriptor.key.clone(),
                        DependencyInfo {
                            key: descriptor.key.clone(),
                            dependencies: descriptor.dependencies.clone(),
                            lifetime: descriptor.lifetime,
                        },
                    )
                })
                .collect();
            GraphValidator::new(infos).validate()?;
        } else {
            debug!("Dependency graph validation skipped");
        }

        info!("Container built");
        Ok(Container {
            inner: Arc::new(ContainerInner {
                registry: self.registry,
                singletons: SingletonCache::default(),
                builds: BuildTracker::default(),
                options: self.options,
                next_scope_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

// ═══════════════════════════════════════════
// Container
// ═══════════════════════════════════════════

/// Immutable, thread-safe container. Clones share everything.
///
/// Created by [`ContainerBuilder::build()`].
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    registry: Registry,
    singletons: SingletonCache,
    builds: BuildTracker,
    options: ContainerOptions,
    next_scope_id: AtomicU64,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct SingletonCache {
    cells: DashMap<ServiceKey, Arc<OnceCell<AnyInstance>>>,
    /// Keys in the order their instances finished building.
    built: Mutex<Vec<ServiceKey>>,
}

impl Container {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// Resolves `T` outside of any scope.
    ///
    /// Scoped services (and anything depending on them) fail with
    /// [`KhidmaError::NoActiveScope`]; resolve those through a [`Scope`].
    pub async fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve_root::<T>(ServiceKey::of::<T>(), None).await
    }

    pub async fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &'static str) -> Result<Arc<T>> {
        self.resolve_root::<T>(ServiceKey::named::<T>(name), None).await
    }

    /// `Ok(None)` when `T` is not registered.
    pub async fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        if !self.contains::<T>() {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    /// Resolves `T` unless `cancel` completes first.
    ///
    /// A singleton whose construction is cancelled is not cached; the next
    /// resolution builds it again.
    pub async fn resolve_or_cancel<T, C>(&self, cancel: C) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
        C: Future,
    {
        tokio::select! {
            biased;
            resolved = self.resolve::<T>() => resolved,
            _ = cancel => {
                let key = ServiceKey::of::<T>();
                debug!(key = %key, "Resolution cancelled");
                Err(KhidmaError::Cancelled { key })
            }
        }
    }

    /// Opens a new unit of work with its own scope stack.
    pub fn create_scope(&self) -> Scope {
        Scope::root(self.clone())
    }

    /// Runs `work` inside a fresh scope and disposes the scope afterwards,
    /// whether `work` failed or not.
    ///
    /// An error from `work` takes precedence over a disposal error.
    pub async fn in_scope<F, Fut, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let scope = self.create_scope();
        let outcome = work(scope.clone()).await;
        let disposed = scope.dispose().await;

        match (outcome, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(disposal)) => Err(disposal),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(disposal)) => {
                warn!(error = %disposal, "Scope disposal failed after an error");
                Err(error)
            }
        }
    }

    /// Injector resolving outside of any scope.
    pub fn injector(&self) -> Injector {
        Injector::new(self.clone(), None)
    }

    /// Disposes built singletons in reverse build order and refuses further
    /// resolutions with [`KhidmaError::ShutDown`].
    ///
    /// Every disposer runs; failures are collected into
    /// [`KhidmaError::Disposal`]. Calling it again is a no-op.
    #[instrument(skip(self), name = "container_shutdown")]
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let order = std::mem::take(&mut *self.inner.singletons.built.lock());
        info!(singletons = order.len(), "Shutting down container");

        let mut failures = Vec::new();
        for key in order.into_iter().rev() {
            let Some((_, cell)) = self.inner.singletons.cells.remove(&key) else {
                continue;
            };
            let Some(descriptor) = self.inner.registry.get(&key) else {
                continue;
            };
            let (Some(disposer), Some(instance)) = (&descriptor.disposer, cell.get()) else {
                continue;
            };

            if let Err(error) = disposer(instance.clone()).await {
                warn!(key = %key, error = %error, "Singleton disposer failed");
                failures.push(DisposalFailure { key, error });
            }
        }
        self.inner.singletons.cells.clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KhidmaError::Disposal(DisposalError { failures }))
        }
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.contains_key(&ServiceKey::of::<T>())
    }

    pub fn contains_key(&self, key: &ServiceKey) -> bool {
        self.inner.registry.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.inner.options
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    // ── Internal ──

    pub(crate) fn descriptor(&self, key: &ServiceKey) -> Option<&Descriptor> {
        self.inner.registry.get(key)
    }

    pub(crate) fn builds(&self) -> &BuildTracker {
        &self.inner.builds
    }

    pub(crate) fn next_scope_id(&self) -> u64 {
        self.inner.next_scope_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn not_registered(&self, requested: ServiceKey, required_by: Option<ServiceKey>) -> KhidmaError {
        let suggestions = similar_keys(&requested, self.inner.registry.keys());
        KhidmaError::ServiceNotRegistered(NotRegisteredError {
            requested,
            required_by,
            suggestions,
        })
    }

    /// Top-level resolution, bounded by the configured timeout.
    pub(crate) async fn resolve_root<T>(&self, key: ServiceKey, scope: Option<Scope>) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let resolution = Resolution::root(self.clone(), scope);
        self.bounded(&key, resolution.get_key::<T>(key.clone())).await
    }

    pub(crate) async fn bounded<R>(&self, key: &ServiceKey, work: impl Future<Output = Result<R>>) -> Result<R> {
        match self.inner.options.resolve_timeout() {
            Some(after) => tokio::time::timeout(after, work).await.unwrap_or_else(|_| {
                warn!(key = %key, ?after, "Resolution timed out");
                Err(KhidmaError::TimedOut {
                    key: key.clone(),
                    after,
                })
            }),
            None => work.await,
        }
    }

    /// Returns the cached singleton, building it on first use.
    ///
    /// Concurrent first resolutions wait on the same cell, so the recipe
    /// runs once. A failed or dropped build leaves the cell empty.
    pub(crate) async fn singleton(&self, descriptor: &Descriptor, resolution: Resolution) -> Result<AnyInstance> {
        let cell = self
            .inner
            .singletons
            .cells
            .entry(descriptor.key.clone())
            .or_default()
            .clone();
        if let Some(instance) = cell.get() {
            return Ok(instance.clone());
        }

        let slot = Slot::singleton(descriptor.key.clone());
        let owner = resolution.owner();
        let _waiting = self.inner.builds.wait(owner, slot.clone(), resolution.outer_chain())?;

        let instance = cell
            .get_or_try_init(move || async move {
                let _building = self.inner.builds.begin(owner, &slot);
                let instance = descriptor.construct(resolution).await?;
                self.inner.singletons.built.lock().push(descriptor.key.clone());
                debug!(key = %descriptor.key, "Singleton built");
                Ok::<_, KhidmaError>(instance)
            })
            .await?;

        Ok(instance.clone())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("registered", &self.inner.registry.len())
            .field("singletons_built", &self.inner.singletons.built.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

// ═══════════════════════════════════════════
// Prelude
// ═══════════════════════════════════════════

pub mod prelude {
    pub use super::{Container, ContainerBuilder};
    pub use crate::dependency::{Dependencies, Dependency, Injectable};
    pub use crate::dispose::{AsyncDispose, Dispose};
    pub use crate::error::{BoxError, KhidmaError, Result};
    pub use crate::injector::{Context, Injected, Injector};
    pub use crate::key::ServiceKey;
    pub use crate::lifetime::Lifetime;
    pub use crate::options::ContainerOptions;
    pub use crate::provider::Provider;
    pub use crate::recipe::Recipe;
    pub use crate::resolution::Resolution;
    pub use crate::scope::{Scope, ScopeStack};
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Injectable;
    use crate::dispose::Dispose;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Config {
        dsn: &'static str,
    }

    struct Engine {
        config: Arc<Config>,
    }

    impl Injectable for Engine {
        type Deps = (Arc<Config>,);

        fn construct((config,): Self::Deps) -> std::result::Result<Self, BoxError> {
            Ok(Engine { config })
        }
    }

    struct Repository {
        engine: Arc<Engine>,
    }

    impl Injectable for Repository {
        type Deps = (Arc<Engine>,);

        fn construct((engine,): Self::Deps) -> std::result::Result<Self, BoxError> {
            Ok(Repository { engine })
        }
    }

    struct Session;

    fn counting<T: Send + Sync + 'static>(
        counter: &Arc<AtomicUsize>,
        make: fn() -> T,
    ) -> Recipe<T> {
        let counter = counter.clone();
        Recipe::factory(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(make()))
        })
    }

    #[tokio::test]
    async fn duplicate_keeps_the_first_registration() {
        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::value(Config { dsn: "first" }))
            .unwrap();

        let err = builder
            .register_singleton(Recipe::value(Config { dsn: "second" }))
            .unwrap_err();
        assert!(matches!(err, KhidmaError::DuplicateRegistration(_)));

        let container = builder.build().unwrap();
        assert_eq!(container.resolve::<Config>().await.unwrap().dsn, "first");
    }

    #[tokio::test]
    async fn singleton_is_shared_across_scopes() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut builder = Container::builder();
        builder
            .register_singleton(counting(&built, || Config { dsn: "x" }))
            .unwrap();
        let container = builder.build().unwrap();

        let a = container.resolve::<Config>().await.unwrap();
        let b = container.resolve::<Config>().await.unwrap();
        let c = container.create_scope().resolve::<Config>().await.unwrap();
        let d = container.create_scope().resolve::<Config>().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(&c, &d));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_is_never_reused() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut builder = Container::builder();
        builder.register_transient(counting(&built, || Session)).unwrap();
        let container = builder.build().unwrap();

        let a = container.resolve::<Session>().await.unwrap();
        let b = container.resolve::<Session>().await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_resolutions_build_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();

        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::<Config>::async_factory(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Arc::new(Config { dsn: "pool" }))
                }
            }))
            .unwrap();
        let container = builder.build().unwrap();

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let container = container.clone();
                tokio::spawn(async move { container.resolve::<Config>().await })
            })
            .collect();

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[tokio::test]
    async fn constructors_resolve_a_chain() {
        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::value(Config { dsn: "postgres://localhost" }))
            .unwrap()
            .register_singleton(Recipe::<Engine>::construct())
            .unwrap()
            .register_transient(Recipe::<Repository>::construct())
            .unwrap();
        let container = builder.build().unwrap();

        let repo = container.resolve::<Repository>().await.unwrap();
        assert_eq!(repo.engine.config.dsn, "postgres://localhost");

        let engine = container.resolve::<Engine>().await.unwrap();
        assert!(Arc::ptr_eq(&repo.engine, &engine));
    }

    #[tokio::test]
    async fn named_keys_are_separate() {
        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::value(Config { dsn: "primary" }))
            .unwrap()
            .register_singleton(Recipe::value(Config { dsn: "replica" }).named("replica"))
            .unwrap();
        let container = builder.build().unwrap();

        assert_eq!(container.resolve::<Config>().await.unwrap().dsn, "primary");
        assert_eq!(
            container.resolve_named::<Config>("replica").await.unwrap().dsn,
            "replica"
        );
    }

    #[tokio::test]
    async fn missing_service_names_its_consumer() {
        let mut builder = Container::builder();
        builder
            .options(ContainerOptions {
                validate_on_build: false,
                ..ContainerOptions::default()
            })
            .register_transient(Recipe::<Engine>::construct())
            .unwrap();
        let container = builder.build().unwrap();

        match container.resolve::<Engine>().await {
            Err(KhidmaError::ServiceNotRegistered(e)) => {
                assert_eq!(e.requested, ServiceKey::of::<Config>());
                assert_eq!(e.required_by, Some(ServiceKey::of::<Engine>()));
            }
            other => panic!("Expected ServiceNotRegistered, got: {:?}", other.map(|_| ())),
        }

        assert!(container.try_resolve::<Session>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_declared_dependency_fails_the_build() {
        let mut builder = Container::builder();
        builder.register_transient(Recipe::<Engine>::construct()).unwrap();

        assert!(matches!(
            builder.build(),
            Err(KhidmaError::ServiceNotRegistered(_))
        ));
    }

    struct Left {
        _right: Arc<Right>,
    }
    struct Right {
        _left: Arc<Left>,
    }

    impl Injectable for Left {
        type Deps = (Arc<Right>,);

        fn construct((right,): Self::Deps) -> std::result::Result<Self, BoxError> {
            Ok(Left { _right: right })
        }
    }

    impl Injectable for Right {
        type Deps = (Arc<Left>,);

        fn construct((left,): Self::Deps) -> std::result::Result<Self, BoxError> {
            Ok(Right { _left: left })
        }
    }

    fn cyclic_builder() -> ContainerBuilder {
        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::<Left>::construct())
            .unwrap()
            .register_singleton(Recipe::<Right>::construct())
            .unwrap();
        builder
    }

    #[test]
    fn cycle_is_rejected_at_build_time() {
        match cyclic_builder().build() {
            Err(KhidmaError::CyclicDependency(e)) => assert_eq!(e.chain.len(), 3),
            other => panic!("Expected CyclicDependency, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn cycle_is_detected_at_runtime() {
        let mut builder = cyclic_builder();
        builder.options(ContainerOptions {
            validate_on_build: false,
            ..ContainerOptions::default()
        });
        let container = builder.build().unwrap();

        match container.resolve::<Left>().await {
            Err(KhidmaError::CyclicDependency(e)) => {
                assert_eq!(
                    e.chain,
                    vec![
                        ServiceKey::of::<Left>(),
                        ServiceKey::of::<Right>(),
                        ServiceKey::of::<Left>(),
                    ]
                );
            }
            other => panic!("Expected CyclicDependency, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn depth_ceiling_applies() {
        let mut builder = Container::builder();
        builder
            .options(ContainerOptions {
                max_resolution_depth: 2,
                ..ContainerOptions::default()
            })
            .register_singleton(Recipe::value(Config { dsn: "x" }))
            .unwrap()
            .register_transient(Recipe::<Engine>::construct())
            .unwrap()
            .register_transient(Recipe::<Repository>::construct())
            .unwrap();
        let container = builder.build().unwrap();

        assert!(container.resolve::<Engine>().await.is_ok());
        assert!(matches!(
            container.resolve::<Repository>().await,
            Err(KhidmaError::ResolutionTooDeep { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn factory_errors_pass_through() {
        let mut builder = Container::builder();
        builder
            .register_transient(Recipe::<Session>::factory(|| Err("connection refused".into())))
            .unwrap()
            .register_transient(Recipe::<Engine>::async_factory(|resolution| async move {
                let config = resolution.get::<Config>().await?;
                Ok(Arc::new(Engine { config }))
            }))
            .unwrap();
        let container = builder.build().unwrap();

        match container.resolve::<Session>().await {
            Err(KhidmaError::Factory(e)) => assert_eq!(e.to_string(), "connection refused"),
            other => panic!("Expected Factory, got: {:?}", other.map(|_| ())),
        }

        // A container error raised inside a factory is not wrapped twice.
        assert!(matches!(
            container.resolve::<Engine>().await,
            Err(KhidmaError::ServiceNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn singleton_never_sees_a_scope() {
        let mut builder = Container::builder();
        builder
            .register_scoped(Recipe::from_fn(|| Session))
            .unwrap()
            .register_singleton(Recipe::<Repository>::async_factory(|resolution| async move {
                let _session = resolution.get::<Session>().await?;
                Err("unreachable".into())
            }))
            .unwrap();
        let container = builder.build().unwrap();
        let scope = container.create_scope();

        assert!(matches!(
            scope.resolve::<Repository>().await,
            Err(KhidmaError::NoActiveScope(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_singleton_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::<Config>::async_factory(move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        std::future::pending::<()>().await;
                    }
                    Ok(Arc::new(Config { dsn: "late" }))
                }
            }))
            .unwrap();
        let container = builder.build().unwrap();

        let cancelled = container.resolve_or_cancel::<Config, _>(async {}).await;
        assert!(matches!(cancelled, Err(KhidmaError::Cancelled { .. })));

        let config = container.resolve::<Config>().await.unwrap();
        assert_eq!(config.dsn, "late");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolve_timeout_is_enforced() {
        let mut builder = Container::builder();
        builder
            .options(ContainerOptions {
                resolve_timeout_ms: Some(20),
                ..ContainerOptions::default()
            })
            .register_transient(Recipe::<Session>::async_factory(|_| async {
                std::future::pending::<()>().await;
                Ok(Arc::new(Session))
            }))
            .unwrap();
        let container = builder.build().unwrap();

        assert!(matches!(
            container.resolve::<Session>().await,
            Err(KhidmaError::TimedOut { .. })
        ));
    }

    struct Pool {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Dispose for Pool {
        fn dispose(&self) -> std::result::Result<(), BoxError> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_disposes_in_reverse_build_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (log.clone(), log.clone());

        let mut builder = Container::builder();
        builder
            .register_singleton(
                Recipe::value(Pool { name: "primary", log: first }).disposable(),
            )
            .unwrap()
            .register_singleton(
                Recipe::value(Pool { name: "replica", log: second })
                    .named("replica")
                    .disposable(),
            )
            .unwrap();
        let container = builder.build().unwrap();

        container.resolve::<Pool>().await.unwrap();
        container.resolve_named::<Pool>("replica").await.unwrap();
        container.shutdown().await.unwrap();

        assert_eq!(*log.lock(), vec!["replica", "primary"]);
        assert!(matches!(
            container.resolve::<Pool>().await,
            Err(KhidmaError::ShutDown { .. })
        ));
        container.shutdown().await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn in_scope_always_disposes() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();

        let mut builder = Container::builder();
        builder
            .register_scoped(Recipe::from_fn(|| Session).on_dispose(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let container = builder.build().unwrap();

        let result: Result<()> = container
            .in_scope(|scope| async move {
                scope.resolve::<Session>().await?;
                Err(KhidmaError::Factory("handler failed".into()))
            })
            .await;

        assert!(matches!(result, Err(KhidmaError::Factory(_))));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_shows_counts() {
        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::value(1i32))
            .unwrap()
            .register_singleton(Recipe::value(String::from("x")))
            .unwrap();
        let container = builder.build().unwrap();

        let debug = format!("{container:?}");
        assert!(debug.contains("Container"));
        assert!(debug.contains("registered: 2"));
    }

    #[test]
    fn declared_named_edge_is_validated_at_build() {
        let recipe = || {
            Recipe::<Session>::async_factory(|r| async move {
                r.get_named::<Config>("replica").await?;
                Ok(Arc::new(Session))
            })
            .depends_on_named::<Config>("replica")
        };

        let mut builder = Container::builder();
        builder.register_transient(recipe()).unwrap();
        match builder.build() {
            Err(KhidmaError::ServiceNotRegistered(e)) => {
                assert_eq!(e.requested, ServiceKey::named::<Config>("replica"));
            }
            other => panic!("Expected ServiceNotRegistered, got: {:?}", other.map(|_| ())),
        }

        let mut builder = Container::builder();
        builder
            .register_singleton(Recipe::value(Config { dsn: "replica" }).named("replica"))
            .unwrap()
            .register_transient(recipe())
            .unwrap();
        assert!(builder.build().is_ok());
    }

    struct Ping;
    struct Pong;

    /// `Ping` and `Pong` need each other through undeclared edges.
    fn crossed(lifetime: Lifetime) -> Container {
        let mut builder = Container::builder();
        builder
            .register(
                lifetime,
                Recipe::<Ping>::async_factory(|r| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    r.get::<Pong>().await?;
                    Ok(Arc::new(Ping))
                }),
            )
            .unwrap()
            .register(
                lifetime,
                Recipe::<Pong>::async_factory(|r| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    r.get::<Ping>().await?;
                    Ok(Arc::new(Pong))
                }),
            )
            .unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn undeclared_cycle_fails_at_runtime() {
        let container = crossed(Lifetime::Singleton);

        match container.resolve::<Ping>().await {
            Err(KhidmaError::CyclicDependency(e)) => assert_eq!(
                e.chain,
                vec![ServiceKey::of::<Ping>(), ServiceKey::of::<Pong>(), ServiceKey::of::<Ping>()]
            ),
            other => panic!("Expected CyclicDependency, got: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_singleton_cycle_fails_instead_of_hanging() {
        let container = crossed(Lifetime::Singleton);

        let ping = tokio::spawn({
            let container = container.clone();
            async move { container.resolve::<Ping>().await.map(|_| ()) }
        });
        let pong = tokio::spawn({
            let container = container.clone();
            async move { container.resolve::<Pong>().await.map(|_| ()) }
        });

        let (ping, pong) = tokio::time::timeout(Duration::from_secs(5), async {
            (ping.await.unwrap(), pong.await.unwrap())
        })
        .await
        .expect("concurrent resolutions deadlocked");

        assert!(matches!(ping, Err(KhidmaError::CyclicDependency(_))), "{ping:?}");
        assert!(matches!(pong, Err(KhidmaError::CyclicDependency(_))), "{pong:?}");

        // The failed builds left no cached instance behind.
        assert!(matches!(
            container.resolve::<Ping>().await,
            Err(KhidmaError::CyclicDependency(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_scoped_cycle_in_one_scope_fails_instead_of_hanging() {
        let container = crossed(Lifetime::Scoped);
        let scope = container.create_scope();

        let ping = tokio::spawn({
            let scope = scope.clone();
            async move { scope.resolve::<Ping>().await.map(|_| ()) }
        });
        let pong = tokio::spawn({
            let scope = scope.clone();
            async move { scope.resolve::<Pong>().await.map(|_| ()) }
        });

        let (ping, pong) = tokio::time::timeout(Duration::from_secs(5), async {
            (ping.await.unwrap(), pong.await.unwrap())
        })
        .await
        .expect("concurrent resolutions deadlocked");

        assert!(matches!(ping, Err(KhidmaError::CyclicDependency(_))), "{ping:?}");
        assert!(matches!(pong, Err(KhidmaError::CyclicDependency(_))), "{pong:?}");
        scope.dispose().await.unwrap();
    }
}
