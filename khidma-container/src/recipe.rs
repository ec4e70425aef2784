//! Recipes: how a registered service gets built.
//!
//! A [`Recipe<T>`] is typed by the key it is registered under. `T` may be a
//! trait object; every recipe produces `Arc<T>`.
//!
//! | constructor | source |
//! |---|---|
//! | [`Recipe::instance`] / [`Recipe::value`] | pre-built (Singleton only) |
//! | [`Recipe::factory`] / [`Recipe::from_fn`] | zero-argument closure |
//! | [`Recipe::factory_with`] | closure over a declared dependency tuple |
//! | [`Recipe::async_factory`] | async closure with a [`Resolution`] context |
//! | [`Recipe::construct`] | [`Injectable`] type |
//! | [`Recipe::bind`] | [`Injectable`] type behind an abstract key |

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::dependency::{Dependencies, Injectable};
use crate::dispose::{AsyncDispose, Dispose, async_disposer, custom_disposer, sync_disposer};
use crate::error::{BoxError, KhidmaError, Result};
use crate::key::ServiceKey;
use crate::lifetime::Lifetime;
use crate::registry::{AnyInstance, BoxFuture, Descriptor, Disposer, Factory, Source, erase};
use crate::resolution::Resolution;

/// What kind of recipe a descriptor was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeKind {
    Instance,
    Factory,
    AsyncFactory,
    Constructor,
}

/// A typed recipe for building `T`.
pub struct Recipe<T: ?Sized> {
    kind: RecipeKind,
    source: Source,
    dependencies: Vec<ServiceKey>,
    disposer: Option<Disposer>,
    name: Option<&'static str>,
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Recipe<T> {
    fn from_source(kind: RecipeKind, source: Source, dependencies: Vec<ServiceKey>) -> Self {
        Self {
            kind,
            source,
            dependencies,
            disposer: None,
            name: None,
            _marker: PhantomData,
        }
    }

    /// A pre-built instance. Only valid for singletons.
    pub fn instance(value: Arc<T>) -> Self {
        Self::from_source(RecipeKind::Instance, Source::Instance(erase(value)), Vec::new())
    }

    /// A pre-built value, wrapped in an `Arc`.
    pub fn value(value: T) -> Self
    where
        T: Sized,
    {
        Self::instance(Arc::new(value))
    }

    /// A zero-argument factory.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use khidma_container::recipe::Recipe;
    ///
    /// let recipe = Recipe::<String>::factory(|| Ok(Arc::new("postgres://localhost".to_string())));
    /// ```
    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Arc<T>, BoxError> + Send + Sync + 'static,
    {
        let build: Factory = Arc::new(move |_resolution: Resolution| -> BoxFuture<'static, Result<AnyInstance>> {
            let outcome = factory().map(erase).map_err(KhidmaError::from_boxed);
            Box::pin(std::future::ready(outcome))
        });
        Self::from_source(RecipeKind::Factory, Source::Factory(build), Vec::new())
    }

    /// A factory for values that cannot fail to build.
    pub fn from_fn<F>(make: F) -> Self
    where
        T: Sized,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::factory(move || Ok(Arc::new(make())))
    }

    /// A factory over a declared dependency tuple.
    ///
    /// The tuple's required members become graph edges checked by
    /// `build()`.
    pub fn factory_with<D, F>(factory: F) -> Self
    where
        D: Dependencies,
        F: Fn(D) -> std::result::Result<Arc<T>, BoxError> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let build: Factory = Arc::new(move |resolution: Resolution| -> BoxFuture<'static, Result<AnyInstance>> {
            let factory = factory.clone();
            Box::pin(async move {
                let deps = D::resolve(&resolution).await?;
                factory(deps).map(erase).map_err(KhidmaError::from_boxed)
            })
        });
        Self::from_source(RecipeKind::Factory, Source::Factory(build), D::declared())
    }

    /// An asynchronous factory.
    ///
    /// The [`Resolution`] lets the factory resolve whatever it needs; those
    /// lookups are not visible to build-time validation unless declared with
    /// [`depends_on`](Self::depends_on).
    pub fn async_factory<F, Fut>(factory: F) -> Self
    where
        F: Fn(Resolution) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Arc<T>, BoxError>> + Send + 'static,
    {
        let build: Factory = Arc::new(move |resolution: Resolution| -> BoxFuture<'static, Result<AnyInstance>> {
            let pending = factory(resolution);
            Box::pin(async move { pending.await.map(erase).map_err(KhidmaError::from_boxed) })
        });
        Self::from_source(RecipeKind::AsyncFactory, Source::Factory(build), Vec::new())
    }

    /// Builds `C` through its constructor and exposes it as `T`.
    ///
    /// `cast` performs the unsizing coercion:
    ///
    /// ```
    /// use std::sync::Arc;
    /// use khidma_container::dependency::Injectable;
    /// use khidma_container::error::BoxError;
    /// use khidma_container::recipe::Recipe;
    ///
    /// trait PasswordHasher: Send + Sync {}
    ///
    /// struct Argon;
    /// impl PasswordHasher for Argon {}
    /// impl Injectable for Argon {
    ///     type Deps = ();
    ///     fn construct(_: ()) -> Result<Self, BoxError> {
    ///         Ok(Argon)
    ///     }
    /// }
    ///
    /// let recipe = Recipe::<dyn PasswordHasher>::bind(|argon: Arc<Argon>| -> Arc<dyn PasswordHasher> { argon });
    /// ```
    pub fn bind<C, F>(cast: F) -> Self
    where
        C: Injectable,
        F: Fn(Arc<C>) -> Arc<T> + Send + Sync + 'static,
    {
        let cast = Arc::new(cast);
        let build: Factory = Arc::new(move |resolution: Resolution| -> BoxFuture<'static, Result<AnyInstance>> {
            let cast = cast.clone();
            Box::pin(async move {
                let deps = <C::Deps as Dependencies>::resolve(&resolution).await?;
                let concrete = C::construct(deps).map_err(KhidmaError::from_boxed)?;
                Ok(erase(cast(Arc::new(concrete))))
            })
        });
        Self::from_source(
            RecipeKind::Constructor,
            Source::Factory(build),
            <C::Deps as Dependencies>::declared(),
        )
    }

    /// Builds `T` through its own constructor.
    pub fn construct() -> Self
    where
        T: Injectable,
    {
        Self::bind::<T, _>(|built: Arc<T>| built)
    }

    /// Registers under `name` instead of the bare type key.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Declares an extra dependency for build-time validation.
    pub fn depends_on<U: ?Sized + 'static>(mut self) -> Self {
        self.dependencies.push(ServiceKey::of::<U>());
        self
    }

    /// Like [`depends_on`](Self::depends_on), for a named registration.
    pub fn depends_on_named<U: ?Sized + 'static>(mut self, name: &'static str) -> Self {
        self.dependencies.push(ServiceKey::named::<U>(name));
        self
    }

    /// Calls [`Dispose::dispose`] when the instance is released.
    pub fn disposable(mut self) -> Self
    where
        T: Dispose,
    {
        self.disposer = Some(sync_disposer::<T>(self.key()));
        self
    }

    /// Awaits [`AsyncDispose::dispose`] when the instance is released.
    pub fn async_disposable(mut self) -> Self
    where
        T: AsyncDispose,
    {
        self.disposer = Some(async_disposer::<T>(self.key()));
        self
    }

    /// Runs `dispose` when the instance is released.
    pub fn on_dispose<F>(mut self, dispose: F) -> Self
    where
        F: Fn(&T) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.disposer = Some(custom_disposer::<T, F>(self.key(), dispose));
        self
    }

    pub fn kind(&self) -> RecipeKind {
        self.kind
    }

    /// The key this recipe will be registered under.
    pub fn key(&self) -> ServiceKey {
        ServiceKey::of::<T>().with_name(self.name)
    }

    pub(crate) fn into_descriptor(self, lifetime: Lifetime) -> Result<Descriptor> {
        let key = self.key();
        if self.kind == RecipeKind::Instance && lifetime != Lifetime::Singleton {
            return Err(KhidmaError::InstanceRequiresSingleton { key, lifetime });
        }

        Ok(Descriptor {
            key,
            lifetime,
            kind: self.kind,
            source: self.source,
            dependencies: self.dependencies,
            disposer: self.disposer,
        })
    }
}

impl<T: ?Sized> fmt::Debug for Recipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("type", &std::any::type_name::<T>())
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
