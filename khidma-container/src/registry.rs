//! Descriptor registry: every registration, keyed by [`ServiceKey`].
//!
//! Typed [`Recipe`](crate::recipe::Recipe)s are erased into [`Descriptor`]s
//! here. The registry is filled by the builder and frozen into the
//! container by `build()`.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use khidma_support::rendering::suggest_similar;
use tracing::debug;

use crate::error::{BoxError, DuplicateRegistrationError, KhidmaError, Result};
use crate::key::ServiceKey;
use crate::lifetime::Lifetime;
use crate::recipe::RecipeKind;
use crate::resolution::Resolution;

/// Boxed, sendable future. Used at every recursion point of resolution.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A resolved service with its type erased.
///
/// The payload is always an `Arc<T>` for the key's `T`, so trait objects
/// survive erasure and clones keep pointer identity.
pub(crate) type AnyInstance = Arc<dyn Any + Send + Sync>;

/// Builds one instance from a resolution context.
///
/// The context is passed by value so the returned future is `'static`
/// and can be held inside once-cells and spawned tasks.
pub(crate) type Factory = Arc<dyn Fn(Resolution) -> BoxFuture<'static, Result<AnyInstance>> + Send + Sync>;

/// Releases one instance. Declared per registration.
pub(crate) type Disposer =
    Arc<dyn Fn(AnyInstance) -> BoxFuture<'static, std::result::Result<(), BoxError>> + Send + Sync>;

#[inline]
pub(crate) fn erase<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> AnyInstance {
    Arc::new(value)
}

/// Recovers the typed `Arc<T>` from an erased instance.
pub(crate) fn downcast<T: ?Sized + Send + Sync + 'static>(
    key: &ServiceKey,
    instance: &AnyInstance,
) -> Result<Arc<T>> {
    (**instance)
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or_else(|| KhidmaError::TypeMismatch {
            key: key.clone(),
            expected: type_name::<T>(),
        })
}

/// Registered keys resembling `requested`, for "did you mean" hints.
///
/// Other names of the same type come first, then keys whose type names are
/// close.
pub(crate) fn similar_keys<'a>(
    requested: &ServiceKey,
    available: impl Iterator<Item = &'a ServiceKey>,
) -> Vec<ServiceKey> {
    const MAX_SUGGESTIONS: usize = 3;

    let available: Vec<&ServiceKey> = available.filter(|k| *k != requested).collect();
    let mut found: Vec<ServiceKey> = available
        .iter()
        .filter(|k| ServiceKey::type_id(k) == requested.type_id())
        .map(|k| (*k).clone())
        .collect();

    let mut names: Vec<&str> = available
        .iter()
        .filter(|k| ServiceKey::type_id(k) != requested.type_id())
        .map(|k| k.type_name())
        .collect();
    names.sort_unstable();
    names.dedup();

    for name in suggest_similar(requested.type_name(), &names, MAX_SUGGESTIONS) {
        found.extend(
            available
                .iter()
                .filter(|k| k.type_name() == name)
                .map(|k| (*k).clone()),
        );
    }

    found.truncate(MAX_SUGGESTIONS);
    found
}

/// Where instances of a descriptor come from.
#[derive(Clone)]
pub(crate) enum Source {
    /// Pre-built, handed out as is.
    Instance(AnyInstance),
    /// Built on demand.
    Factory(Factory),
}

/// Registration entry for a single service.
#[derive(Clone)]
pub(crate) struct Descriptor {
    pub key: ServiceKey,
    pub lifetime: Lifetime,
    pub kind: RecipeKind,
    pub source: Source,
    /// Keys this recipe declares it needs. Used for graph validation only;
    /// async factories may resolve more at runtime.
    pub dependencies: Vec<ServiceKey>,
    pub disposer: Option<Disposer>,
}

impl Descriptor {
    /// Runs the recipe once.
    pub fn construct(&self, resolution: Resolution) -> BoxFuture<'static, Result<AnyInstance>> {
        match &self.source {
            Source::Instance(instance) => {
                let instance = instance.clone();
                Box::pin(async move { Ok(instance) })
            }
            Source::Factory(factory) => factory(resolution),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("disposable", &self.disposer.is_some())
            .finish()
    }
}

/// Stores all descriptors. Write-once per key.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    descriptors: HashMap<ServiceKey, Descriptor>,
}

impl Registry {
    /// Stores a descriptor.
    ///
    /// # Errors
    /// [`KhidmaError::DuplicateRegistration`] if the key is taken; the
    /// existing descriptor is left untouched.
    pub fn register(&mut self, descriptor: Descriptor) -> Result<()> {
        if let Some(existing) = self.descriptors.get(&descriptor.key) {
            return Err(KhidmaError::DuplicateRegistration(
                DuplicateRegistrationError {
                    key: descriptor.key,
                    existing: existing.lifetime,
                },
            ));
        }

        debug!(
            key = %descriptor.key,
            lifetime = %descriptor.lifetime,
            kind = ?descriptor.kind,
            "Registered service"
        );
        self.descriptors.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, key: &ServiceKey) -> Option<&Descriptor> {
        self.descriptors.get(key)
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.descriptors.contains_key(key)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.descriptors.keys()
    }
}
