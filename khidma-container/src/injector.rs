//! Calling plain functions with their dependencies filled in.
//!
//! [`Injector::wrap`] turns a closure or function into an [`Injected`]
//! adapter. Each parameter is one of:
//!
//! | parameter | filled with |
//! |---|---|
//! | `Arc<T>` | the resolved `T` (or a value given to [`Injected::supply`]) |
//! | `Option<Arc<T>>` | the resolved `T`, `None` if it is not registered |
//! | [`Context<C>`] | the value passed to [`Injected::call`] |
//!
//! ```
//! use std::sync::Arc;
//! use khidma_container::prelude::*;
//!
//! #[derive(Clone)]
//! struct Request { path: String }
//! struct Router;
//!
//! fn handle(request: Context<Request>, _router: Arc<Router>) -> String {
//!     format!("GET {}", request.path)
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut builder = Container::builder();
//! builder.register_singleton(Recipe::value(Router))?;
//! let container = builder.build()?;
//!
//! let endpoint = container.injector().wrap(handle);
//! let body = endpoint.call(Request { path: "/users".into() }).await?;
//! assert_eq!(body, "GET /users");
//! # Ok::<(), KhidmaError>(())
//! # }).unwrap();
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use tracing::trace;

use crate::container::Container;
use crate::dependency::{Dependencies, Injectable};
use crate::error::{KhidmaError, Result};
use crate::key::ServiceKey;
use crate::registry::{BoxFuture, erase};
use crate::resolution::{Resolution, Supplied};
use crate::scope::Scope;

/// Resolves parameters for wrapped callables and ad hoc constructions.
#[derive(Clone, Debug)]
pub struct Injector {
    container: Container,
    scope: Option<Scope>,
}

impl Injector {
    pub(crate) fn new(container: Container, scope: Option<Scope>) -> Self {
        Self { container, scope }
    }

    /// Wraps `target`. The target itself is left as it is.
    pub fn wrap<F, C, Args>(&self, target: F) -> Injected<F, C, Args>
    where
        F: Handler<Args>,
        Args: Params<C>,
    {
        Injected {
            target: Arc::new(target),
            injector: self.clone(),
            supplied: Arc::new(Supplied::new()),
            _marker: PhantomData,
        }
    }

    /// Builds `T` through its constructor without registering it.
    pub async fn construct<T: Injectable>(&self) -> Result<T> {
        let key = ServiceKey::of::<T>();
        let resolution = self.resolution()?.descend(&key, self.scope.clone());

        self.container
            .bounded(&key, async {
                let deps = <T::Deps as Dependencies>::resolve(&resolution).await?;
                T::construct(deps).map_err(KhidmaError::from_boxed)
            })
            .await
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    fn resolution(&self) -> Result<Resolution> {
        if self.scope.as_ref().is_some_and(Scope::is_disposed) {
            return Err(KhidmaError::no_active_scope(None));
        }
        Ok(Resolution::root(self.container.clone(), self.scope.clone()))
    }
}

/// The caller-provided context parameter of an injected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context<C>(pub C);

impl<C> Context<C> {
    pub fn into_inner(self) -> C {
        self.0
    }
}

impl<C> Deref for Context<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.0
    }
}

/// One parameter of an injected callable.
pub trait Param<C>: Sized + Send + 'static {
    fn extract<'a>(context: &'a C, resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>>;
}

impl<C, T> Param<C> for Arc<T>
where
    C: Sync,
    T: ?Sized + Send + Sync + 'static,
{
    fn extract<'a>(_context: &'a C, resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>> {
        Box::pin(resolution.get::<T>())
    }
}

impl<C, T> Param<C> for Option<Arc<T>>
where
    C: Sync,
    T: ?Sized + Send + Sync + 'static,
{
    fn extract<'a>(_context: &'a C, resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>> {
        Box::pin(resolution.try_get::<T>())
    }
}

impl<C> Param<C> for Context<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn extract<'a>(context: &'a C, _resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>> {
        Box::pin(std::future::ready(Ok(Context(context.clone()))))
    }
}

/// The whole parameter list: `()` or a tuple of up to eight [`Param`]s.
pub trait Params<C>: Sized + Send + 'static {
    fn extract<'a>(context: &'a C, resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>>;
}

impl<C: Sync> Params<C> for () {
    fn extract<'a>(_context: &'a C, _resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>> {
        Box::pin(std::future::ready(Ok(())))
    }
}

macro_rules! impl_params {
    ($($P:ident),+) => {
        impl<C: Sync, $($P: Param<C>),+> Params<C> for ($($P,)+) {
            fn extract<'a>(context: &'a C, resolution: &'a Resolution) -> BoxFuture<'a, Result<Self>> {
                Box::pin(async move {
                    Ok(($(<$P as Param<C>>::extract(context, resolution).await?,)+))
                })
            }
        }
    };
}

impl_params!(A);
impl_params!(A, B);
impl_params!(A, B, C2);
impl_params!(A, B, C2, D);
impl_params!(A, B, C2, D, E);
impl_params!(A, B, C2, D, E, F);
impl_params!(A, B, C2, D, E, F, G);
impl_params!(A, B, C2, D, E, F, G, H);

/// A callable taking `Args` as a tuple of parameters.
pub trait Handler<Args>: Send + Sync + 'static {
    type Output;

    fn invoke(&self, args: Args) -> Self::Output;
}

macro_rules! impl_handler {
    ($($P:ident),*) => {
        impl<Func, Out, $($P,)*> Handler<($($P,)*)> for Func
        where
            Func: Fn($($P),*) -> Out + Send + Sync + 'static,
        {
            type Output = Out;

            #[allow(non_snake_case)]
            fn invoke(&self, ($($P,)*): ($($P,)*)) -> Out {
                self($($P),*)
            }
        }
    };
}

impl_handler!();
impl_handler!(A);
impl_handler!(A, B);
impl_handler!(A, B, C);
impl_handler!(A, B, C, D);
impl_handler!(A, B, C, D, E);
impl_handler!(A, B, C, D, E, F);
impl_handler!(A, B, C, D, E, F, G);
impl_handler!(A, B, C, D, E, F, G, H);

/// A wrapped callable. Cheap to clone; clones share supplied values.
pub struct Injected<F, C, Args> {
    target: Arc<F>,
    injector: Injector,
    supplied: Arc<Supplied>,
    _marker: PhantomData<fn(C) -> Args>,
}

impl<F, C, Args> Injected<F, C, Args>
where
    F: Handler<Args>,
    Args: Params<C>,
{
    /// Passes `value` for every `Arc<T>` (or `Option<Arc<T>>`) parameter
    /// instead of resolving it.
    pub fn supply<T: ?Sized + Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        Arc::make_mut(&mut self.supplied).insert(ServiceKey::of::<T>(), erase(value));
        self
    }

    /// Resolves the parameters that were not supplied and calls the target.
    pub async fn call(&self, context: C) -> Result<F::Output> {
        let resolution = self
            .injector
            .resolution()?
            .with_supplied(self.supplied.clone());

        trace!(
            callable = std::any::type_name::<F>(),
            supplied = self.supplied.len(),
            "Injecting call"
        );
        let args = <Args as Params<C>>::extract(&context, &resolution).await?;
        Ok(self.target.invoke(args))
    }

    /// [`call`](Self::call) for targets returning a future; awaits it.
    pub async fn call_async(&self, context: C) -> Result<<F::Output as Future>::Output>
    where
        F::Output: Future,
    {
        Ok(self.call(context).await?.await)
    }
}

impl<F, C, Args> Clone for Injected<F, C, Args> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            injector: self.injector.clone(),
            supplied: self.supplied.clone(),
            _marker: PhantomData,
        }
    }
}

impl<F, C, Args> std::fmt::Debug for Injected<F, C, Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injected")
            .field("target", &std::any::type_name::<F>())
            .field("supplied", &self.supplied.len())
            .finish()
    }
}
