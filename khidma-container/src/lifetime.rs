//! Service lifetimes.
//!
//! A lifetime decides how long a resolved instance is reused:
//! - [`Lifetime::Singleton`]: one instance for the whole container
//! - [`Lifetime::Scoped`]: one instance per [`Scope`](crate::scope::Scope)
//! - [`Lifetime::Transient`]: a fresh instance on every resolve

use std::fmt;

/// How long a resolved service lives.
///
/// Ordering follows lifespan, longest first:
///
/// ```
/// use khidma_container::lifetime::Lifetime;
///
/// assert!(Lifetime::Singleton > Lifetime::Scoped);
/// assert!(Lifetime::Scoped > Lifetime::Transient);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Shared by every resolution, built lazily on first use.
    ///
    /// Typical: connection pools, engines, configuration.
    Singleton,

    /// Shared within one unit of work, disposed with its scope.
    ///
    /// Typical: per-request database sessions, current user.
    Scoped,

    /// Never cached.
    ///
    /// Typical: stateless handlers, services that carry per-call state.
    Transient,
}

impl Lifetime {
    #[inline]
    fn rank(&self) -> u8 {
        match self {
            Lifetime::Singleton => 2,
            Lifetime::Scoped => 1,
            Lifetime::Transient => 0,
        }
    }
}

impl PartialOrd for Lifetime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Lifetime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Lifetime::Singleton => "Singleton",
            Lifetime::Scoped => "Scoped",
            Lifetime::Transient => "Transient",
        };
        f.write_str(label)
    }
}
