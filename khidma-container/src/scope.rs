//! Scopes: one cache of scoped instances per unit of work.
//!
//! [`Container::create_scope`] opens a new [`ScopeStack`] with a root scope;
//! [`Scope::create_scope`] pushes a nested scope onto the same stack. Scopes
//! are disposed innermost first. Disposal runs the declared disposers of
//! every scoped instance the scope built, newest first.
//!
//! ```
//! use std::sync::Arc;
//! use khidma_container::prelude::*;
//!
//! struct Session;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut builder = Container::builder();
//! builder.register_scoped(Recipe::from_fn(|| Session))?;
//! let container = builder.build()?;
//!
//! let request = container.create_scope();
//! let a = request.resolve::<Session>().await?;
//! let b = request.resolve::<Session>().await?;
//! assert!(Arc::ptr_eq(&a, &b));
//! request.dispose().await?;
//! # Ok::<(), KhidmaError>(())
//! # }).unwrap();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::container::Container;
use crate::error::{DisposalError, DisposalFailure, KhidmaError, Result, ScopeOrderError};
use crate::inflight::Slot;
use crate::injector::Injector;
use crate::key::ServiceKey;
use crate::registry::{AnyInstance, Descriptor, Disposer};
use crate::resolution::Resolution;

// ============================================================
// ScopeStack
// ============================================================

/// The active scopes of one unit of work, outermost first.
///
/// Shared by every scope opened from the same root; clones share the stack.
#[derive(Clone, Default)]
pub struct ScopeStack {
    frames: Arc<Mutex<Vec<Frame>>>,
}

struct Frame {
    id: u64,
    scope: Weak<ScopeInner>,
}

impl ScopeStack {
    /// The innermost active scope.
    pub fn current(&self) -> Option<Scope> {
        let top = self.frames.lock().last().and_then(|frame| frame.scope.upgrade());
        top.map(|inner| Scope { inner })
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn remove(&self, id: u64) {
        self.frames.lock().retain(|frame| frame.id != id);
    }
}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<u64> = self.frames.lock().iter().map(|frame| frame.id).collect();
        f.debug_struct("ScopeStack").field("active", &ids).finish()
    }
}

// ============================================================
// Scope
// ============================================================

/// Handle to one scope. Clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: u64,
    depth: usize,
    container: Container,
    stack: ScopeStack,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    disposed: bool,
    cache: HashMap<ServiceKey, Arc<OnceCell<AnyInstance>>>,
    /// Built instances with a disposer, in build order.
    pending: Vec<PendingDisposal>,
}

struct PendingDisposal {
    key: ServiceKey,
    disposer: Disposer,
    instance: AnyInstance,
}

impl Scope {
    pub(crate) fn root(container: Container) -> Scope {
        let stack = ScopeStack::default();
        let mut frames = stack.frames.lock();
        Self::push(container, &stack, &mut frames)
    }

    /// Pushes a new scope; the caller holds the stack lock.
    fn push(container: Container, stack: &ScopeStack, frames: &mut Vec<Frame>) -> Scope {
        let id = container.next_scope_id();
        let depth = frames.len();
        let inner = Arc::new(ScopeInner {
            id,
            depth,
            container,
            stack: stack.clone(),
            state: Mutex::new(ScopeState::default()),
        });
        frames.push(Frame {
            id,
            scope: Arc::downgrade(&inner),
        });

        debug!(scope = id, depth, "Scope created");
        Scope { inner }
    }

    /// Opens a scope nested in this one, on the same stack.
    ///
    /// # Errors
    /// [`KhidmaError::NoActiveScope`] if this scope was already disposed.
    pub fn create_scope(&self) -> Result<Scope> {
        let stack = &self.inner.stack;
        let mut frames = stack.frames.lock();
        if self.inner.state.lock().disposed {
            return Err(KhidmaError::no_active_scope(None));
        }
        Ok(Self::push(self.inner.container.clone(), stack, &mut frames))
    }

    /// Resolves `T`. Scoped services are cached in this scope.
    pub async fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.resolve_key::<T>(ServiceKey::of::<T>()).await
    }

    pub async fn resolve_named<T: ?Sized + Send + Sync + 'static>(&self, name: &'static str) -> Result<Arc<T>> {
        self.resolve_key::<T>(ServiceKey::named::<T>(name)).await
    }

    /// `Ok(None)` when `T` is not registered.
    pub async fn try_resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        if !self.inner.container.contains::<T>() {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    async fn resolve_key<T: ?Sized + Send + Sync + 'static>(&self, key: ServiceKey) -> Result<Arc<T>> {
        if self.is_disposed() {
            return Err(KhidmaError::no_active_scope(Some(key)));
        }
        self.inner
            .container
            .resolve_root::<T>(key, Some(self.clone()))
            .await
    }

    /// Injector resolving through this scope.
    pub fn injector(&self) -> Injector {
        Injector::new(self.inner.container.clone(), Some(self.clone()))
    }

    pub fn stack(&self) -> &ScopeStack {
        &self.inner.stack
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Nesting level; a root scope is `0`.
    pub fn depth(&self) -> usize {
        self.inner.depth
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Disposes the scope.
    ///
    /// Every declared disposer runs once, newest instance first, even when
    /// earlier ones fail; failures come back together as
    /// [`KhidmaError::Disposal`].
    ///
    /// # Errors
    /// [`KhidmaError::ScopeOrderViolation`] if a nested scope is still
    /// active or this scope was disposed already. Nothing is disposed then.
    #[instrument(skip(self), name = "scope_dispose", fields(scope = self.inner.id))]
    pub async fn dispose(&self) -> Result<()> {
        let pending = {
            let frames = self.inner.stack.frames.lock();
            let mut state = self.inner.state.lock();
            let innermost = frames.last().map(|frame| frame.id);

            if state.disposed || innermost != Some(self.inner.id) {
                return Err(KhidmaError::ScopeOrderViolation(ScopeOrderError {
                    scope: self.inner.id,
                    innermost: if state.disposed { None } else { innermost },
                }));
            }

            state.disposed = true;
            std::mem::take(&mut state.pending)
        };

        debug!(disposers = pending.len(), "Disposing scope");

        let mut failures = Vec::new();
        for entry in pending.into_iter().rev() {
            if let Err(error) = (entry.disposer)(entry.instance).await {
                warn!(key = %entry.key, error = %error, "Scoped disposer failed");
                failures.push(DisposalFailure {
                    key: entry.key,
                    error,
                });
            }
        }

        let cache = std::mem::take(&mut self.inner.state.lock().cache);
        drop(cache);
        self.inner.stack.remove(self.inner.id);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(KhidmaError::Disposal(DisposalError { failures }))
        }
    }

    /// Returns this scope's instance of a scoped service, building it once.
    pub(crate) async fn scoped(&self, descriptor: &Descriptor, resolution: Resolution) -> Result<AnyInstance> {
        let cell = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(KhidmaError::no_active_scope(Some(descriptor.key.clone())));
            }
            state.cache.entry(descriptor.key.clone()).or_default().clone()
        };
        if let Some(instance) = cell.get() {
            return Ok(instance.clone());
        }

        let builds = self.inner.container.builds();
        let slot = Slot::scoped(self.inner.id, descriptor.key.clone());
        let owner = resolution.owner();
        let _waiting = builds.wait(owner, slot.clone(), resolution.outer_chain())?;

        let instance = cell
            .get_or_try_init(move || async move {
                let _building = builds.begin(owner, &slot);
                let instance = descriptor.construct(resolution).await?;
                self.track(descriptor, &instance)?;
                Ok::<_, KhidmaError>(instance)
            })
            .await?;

        Ok(instance.clone())
    }

    /// Records a freshly built instance for disposal.
    fn track(&self, descriptor: &Descriptor, instance: &AnyInstance) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            warn!(key = %descriptor.key, scope = self.inner.id, "Scope disposed while building; instance dropped");
            return Err(KhidmaError::no_active_scope(Some(descriptor.key.clone())));
        }

        if let Some(disposer) = &descriptor.disposer {
            state.pending.push(PendingDisposal {
                key: descriptor.key.clone(),
                disposer: disposer.clone(),
                instance: instance.clone(),
            });
        }
        Ok(())
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.disposed {
            return;
        }

        warn!(
            scope = self.id,
            undisposed = state.pending.len(),
            "Scope dropped without dispose(); its disposers will not run"
        );
        self.stack.remove(self.id);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("depth", &self.inner.depth)
            .field("cached", &state.cache.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}
