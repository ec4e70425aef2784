//! Statically declared dependencies.
//!
//! Instead of reflecting over constructor signatures, a type lists what it
//! needs as a tuple of [`Dependency`] values. The same list gives the
//! resolver something to fetch and gives `build()` the edges of the
//! dependency graph.
//!
//! ```
//! use std::sync::Arc;
//! use khidma_container::dependency::Injectable;
//! use khidma_container::error::BoxError;
//!
//! struct Engine;
//! struct SessionFactory {
//!     engine: Arc<Engine>,
//! }
//!
//! impl Injectable for SessionFactory {
//!     type Deps = (Arc<Engine>,);
//!
//!     fn construct((engine,): Self::Deps) -> Result<Self, BoxError> {
//!         Ok(SessionFactory { engine })
//!     }
//! }
//! ```

use std::sync::Arc;

use crate::error::{BoxError, Result};
use crate::key::ServiceKey;
use crate::registry::BoxFuture;
use crate::resolution::Resolution;

/// One constructor parameter the container can supply.
///
/// Implemented for:
/// - `Arc<T>`: required; resolution fails if `T` is not registered
/// - `Option<Arc<T>>`: optional; `None` when `T` is not registered
pub trait Dependency: Sized + Send + 'static {
    /// The key this parameter requires, if it is required.
    fn declared() -> Option<ServiceKey>;

    fn fetch(resolution: &Resolution) -> BoxFuture<'_, Result<Self>>;
}

impl<T: ?Sized + Send + Sync + 'static> Dependency for Arc<T> {
    fn declared() -> Option<ServiceKey> {
        Some(ServiceKey::of::<T>())
    }

    fn fetch(resolution: &Resolution) -> BoxFuture<'_, Result<Self>> {
        Box::pin(resolution.get::<T>())
    }
}

impl<T: ?Sized + Send + Sync + 'static> Dependency for Option<Arc<T>> {
    fn declared() -> Option<ServiceKey> {
        None
    }

    fn fetch(resolution: &Resolution) -> BoxFuture<'_, Result<Self>> {
        Box::pin(resolution.try_get::<T>())
    }
}

/// A full parameter list: `()` or a tuple of up to eight [`Dependency`]s.
///
/// Parameters are resolved left to right, depth first.
pub trait Dependencies: Sized + Send + 'static {
    /// Required keys, in parameter order.
    fn declared() -> Vec<ServiceKey>;

    fn resolve(resolution: &Resolution) -> BoxFuture<'_, Result<Self>>;
}

impl Dependencies for () {
    fn declared() -> Vec<ServiceKey> {
        Vec::new()
    }

    fn resolve(_resolution: &Resolution) -> BoxFuture<'_, Result<Self>> {
        Box::pin(async { Ok(()) })
    }
}

macro_rules! impl_dependencies {
    ($($T:ident),+) => {
        impl<$($T: Dependency),+> Dependencies for ($($T,)+) {
            fn declared() -> Vec<ServiceKey> {
                [$(<$T as Dependency>::declared()),+]
                    .into_iter()
                    .flatten()
                    .collect()
            }

            fn resolve(resolution: &Resolution) -> BoxFuture<'_, Result<Self>> {
                Box::pin(async move {
                    Ok(($(<$T as Dependency>::fetch(resolution).await?,)+))
                })
            }
        }
    };
}

impl_dependencies!(A);
impl_dependencies!(A, B);
impl_dependencies!(A, B, C);
impl_dependencies!(A, B, C, D);
impl_dependencies!(A, B, C, D, E);
impl_dependencies!(A, B, C, D, E, F);
impl_dependencies!(A, B, C, D, E, F, G);
impl_dependencies!(A, B, C, D, E, F, G, H);

/// A type the container can build from its declared dependencies.
///
/// Register it with [`Recipe::construct`](crate::recipe::Recipe::construct)
/// (or [`Recipe::bind`](crate::recipe::Recipe::bind) behind a trait
/// object), or build it ad hoc with
/// [`Injector::construct`](crate::injector::Injector::construct).
pub trait Injectable: Sized + Send + Sync + 'static {
    type Deps: Dependencies;

    fn construct(deps: Self::Deps) -> std::result::Result<Self, BoxError>;
}
