//! Error types for container operations.
//!
//! Messages name the services involved and end with a hint where one helps.
//! Errors raised by user factories and constructors are carried through
//! untouched in [`KhidmaError::Factory`].

use std::fmt;
use std::time::Duration;

use khidma_support::rendering::{render_bullets, render_chain};

use crate::key::ServiceKey;
use crate::lifetime::Lifetime;

/// Error type user factories, constructors and disposers return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for all container operations.
#[derive(Debug, thiserror::Error)]
pub enum KhidmaError {
    /// The key was registered before. The first registration stays in effect.
    #[error("{}", .0)]
    DuplicateRegistration(DuplicateRegistrationError),

    /// A pre-built instance was registered with a non-singleton lifetime.
    #[error(
        "Cannot register a pre-built instance of {} as {lifetime}\n  Hint: pre-built instances are always Singleton; use a factory for other lifetimes",
        .key.short_name()
    )]
    InstanceRequiresSingleton { key: ServiceKey, lifetime: Lifetime },

    /// Requested service has no descriptor.
    #[error("{}", .0)]
    ServiceNotRegistered(NotRegisteredError),

    /// A scoped service was requested without an active scope.
    #[error("{}", .0)]
    NoActiveScope(NoActiveScopeError),

    /// A scope was disposed out of LIFO order.
    #[error("{}", .0)]
    ScopeOrderViolation(ScopeOrderError),

    /// The dependency chain loops back on itself.
    #[error("{}", .0)]
    CyclicDependency(CyclicDependencyError),

    /// A singleton would capture a scoped service.
    #[error("{}", .0)]
    ScopeMismatch(ScopeMismatchError),

    /// The resolution chain grew past the configured ceiling.
    #[error("Resolution of {} exceeded the maximum depth of {limit}", .key.short_name())]
    ResolutionTooDeep { key: ServiceKey, limit: usize },

    /// A cached instance did not have the type its key promised.
    #[error("Type mismatch for {key}: expected {expected}")]
    TypeMismatch {
        key: ServiceKey,
        expected: &'static str,
    },

    /// One or more disposers failed. Every disposer still ran.
    #[error("{}", .0)]
    Disposal(DisposalError),

    /// The caller's cancellation signal fired first.
    #[error("Resolution of {} was cancelled", .key.short_name())]
    Cancelled { key: ServiceKey },

    /// The configured resolve timeout elapsed.
    #[error("Resolution of {} timed out after {after:?}", .key.short_name())]
    TimedOut { key: ServiceKey, after: Duration },

    /// [`Container::shutdown`](crate::container::Container::shutdown) already ran.
    #[error("Container is shut down; cannot resolve {}", .key.short_name())]
    ShutDown { key: ServiceKey },

    /// Error raised by a user factory or constructor.
    #[error(transparent)]
    Factory(BoxError),
}

impl KhidmaError {
    /// Converts a factory error, unwrapping container errors that were
    /// boxed on their way through user code (`resolution.get().await?`).
    pub(crate) fn from_boxed(error: BoxError) -> Self {
        match error.downcast::<KhidmaError>() {
            Ok(inner) => *inner,
            Err(other) => KhidmaError::Factory(other),
        }
    }

    pub(crate) fn no_active_scope(requested: Option<ServiceKey>) -> Self {
        KhidmaError::NoActiveScope(NoActiveScopeError { requested })
    }
}

/// The key was already registered.
#[derive(Debug)]
pub struct DuplicateRegistrationError {
    pub key: ServiceKey,
    /// Lifetime of the registration that stays in effect.
    pub existing: Lifetime,
}

impl fmt::Display for DuplicateRegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Service already registered: {} (as {})",
            self.key, self.existing
        )?;
        write!(
            f,
            "\n  Hint: every key is registered once; use a named key to keep several {}",
            self.key.short_name()
        )
    }
}

/// A service was requested that has no descriptor.
#[derive(Debug)]
pub struct NotRegisteredError {
    pub requested: ServiceKey,
    /// The service whose construction asked for it, if any.
    pub required_by: Option<ServiceKey>,
    /// Registered keys with similar names.
    pub suggestions: Vec<ServiceKey>,
}

impl fmt::Display for NotRegisteredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service not registered: {}", self.requested)?;

        if let Some(parent) = &self.required_by {
            write!(f, "\n  Required by: {parent}")?;
        }

        if !self.suggestions.is_empty() {
            let names: Vec<String> = self.suggestions.iter().map(|k| k.to_string()).collect();
            write!(f, "\n  Did you mean one of:{}", render_bullets(&names))?;
        }

        write!(
            f,
            "\n  Hint: register it with register_singleton/register_scoped/register_transient::<{}>()",
            self.requested.short_name()
        )
    }
}

/// Scoped resolution (or nested scope creation) without a live scope.
#[derive(Debug)]
pub struct NoActiveScopeError {
    /// `None` when the failing call was creating a nested scope.
    pub requested: Option<ServiceKey>,
}

impl fmt::Display for NoActiveScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.requested {
            Some(key) => write!(f, "No active scope to resolve scoped service {key}")?,
            None => write!(f, "No active scope: the parent scope was already disposed")?,
        }
        write!(
            f,
            "\n  Hint: resolve through a Scope from create_scope(), and do not use it after dispose()"
        )
    }
}

/// A scope was disposed while it was not the innermost active scope.
#[derive(Debug)]
pub struct ScopeOrderError {
    /// Id of the scope whose disposal was refused.
    pub scope: u64,
    /// Id of the innermost active scope on the same stack.
    pub innermost: Option<u64>,
}

impl fmt::Display for ScopeOrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.innermost {
            Some(top) => write!(
                f,
                "Scope #{} cannot be disposed while nested scope #{} is still active",
                self.scope, top
            )?,
            None => write!(f, "Scope #{} is no longer active", self.scope)?,
        }
        write!(f, "\n  Hint: dispose nested scopes first, in reverse order of creation")
    }
}

/// The resolution chain contains a loop.
#[derive(Debug)]
pub struct CyclicDependencyError {
    /// Keys from the first occurrence of the repeated key to its repeat,
    /// e.g. `[A, B, A]`.
    pub chain: Vec<ServiceKey>,
}

impl fmt::Display for CyclicDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.chain.iter().map(ServiceKey::short_name).collect();
        write!(f, "Cyclic dependency detected:\n  {}", render_chain(&names))?;
        write!(
            f,
            "\n  Hint: break the loop by resolving one side lazily through an async factory"
        )
    }
}

/// A singleton depends on a scoped service, directly or through transients.
#[derive(Debug)]
pub struct ScopeMismatchError {
    pub consumer: ServiceKey,
    pub dependency: ServiceKey,
}

impl fmt::Display for ScopeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scope mismatch: singleton {} depends on scoped {}",
            self.consumer, self.dependency
        )?;
        write!(
            f,
            "\n  A singleton outlives every scope and would keep a disposed instance alive"
        )?;
        write!(
            f,
            "\n  Hint: make {} Scoped, or register {} as Singleton",
            self.consumer.short_name(),
            self.dependency.short_name()
        )
    }
}

/// One failed disposer.
#[derive(Debug)]
pub struct DisposalFailure {
    pub key: ServiceKey,
    pub error: BoxError,
}

/// All disposer failures of one scope (or of container shutdown).
#[derive(Debug)]
pub struct DisposalError {
    pub failures: Vec<DisposalFailure>,
}

impl fmt::Display for DisposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("{}: {}", failure.key.short_name(), failure.error))
            .collect();
        write!(f, "{} disposer(s) failed:{}", lines.len(), render_bullets(&lines))
    }
}

/// Convenient Result type for container operations.
pub type Result<T> = std::result::Result<T, KhidmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    struct UserService;
    struct UserController;

    #[test]
    fn not_registered_mentions_parent_and_hint() {
        let err = KhidmaError::ServiceNotRegistered(NotRegisteredError {
            requested: ServiceKey::of::<UserService>(),
            required_by: Some(ServiceKey::of::<UserController>()),
            suggestions: vec![],
        });

        let msg = err.to_string();
        assert!(msg.contains("not registered"));
        assert!(msg.contains("Required by"));
        assert!(msg.contains("register_transient::<UserService>"));
    }

    #[test]
    fn cycle_renders_arrows() {
        let err = KhidmaError::CyclicDependency(CyclicDependencyError {
            chain: vec![
                ServiceKey::of::<UserService>(),
                ServiceKey::of::<UserController>(),
                ServiceKey::of::<UserService>(),
            ],
        });

        let msg = err.to_string();
        assert!(msg.contains("UserService → UserController → UserService"));
    }

    #[test]
    fn factory_errors_pass_through_unchanged() {
        let original: BoxError = "connection refused".into();
        let err = KhidmaError::from_boxed(original);

        assert_eq!(err.to_string(), "connection refused");
        assert!(matches!(err, KhidmaError::Factory(_)));
    }

    #[test]
    fn boxed_container_errors_are_unwrapped() {
        let inner = KhidmaError::no_active_scope(Some(ServiceKey::of::<UserService>()));
        let boxed: BoxError = Box::new(inner);

        match KhidmaError::from_boxed(boxed) {
            KhidmaError::NoActiveScope(e) => assert!(e.requested.is_some()),
            other => panic!("Expected NoActiveScope, got: {other:?}"),
        }
    }

    #[test]
    fn disposal_lists_every_failure() {
        let err = KhidmaError::Disposal(DisposalError {
            failures: vec![
                DisposalFailure {
                    key: ServiceKey::of::<UserService>(),
                    error: "flush failed".into(),
                },
                DisposalFailure {
                    key: ServiceKey::of::<UserController>(),
                    error: "close failed".into(),
                },
            ],
        });

        let msg = err.to_string();
        assert!(msg.starts_with("2 disposer(s) failed"));
        assert!(msg.contains("UserService: flush failed"));
        assert!(msg.contains("UserController: close failed"));
    }

    #[test]
    fn scope_order_names_innermost() {
        let err = ScopeOrderError { scope: 1, innermost: Some(2) };
        assert!(err.to_string().contains("nested scope #2"));
    }
}
