//! Provider trait: a module of related registrations.
//!
//! # Examples
//! ```rust
//! use khidma_container::prelude::*;
//!
//! struct Engine { dsn: String }
//!
//! struct DatabaseProvider {
//!     dsn: String,
//! }
//!
//! impl Provider for DatabaseProvider {
//!     fn register(&self, builder: &mut ContainerBuilder) -> Result<()> {
//!         builder.register_singleton(Recipe::value(Engine { dsn: self.dsn.clone() }))?;
//!         Ok(())
//!     }
//! }
//!
//! let mut builder = Container::builder();
//! builder.add_provider(&DatabaseProvider { dsn: "sqlite::memory:".into() })?;
//! assert!(builder.contains::<Engine>());
//! # Ok::<(), KhidmaError>(())
//! ```

use crate::container::ContainerBuilder;
use crate::error::Result;

/// A module that registers related services into a builder.
///
/// Split registrations by concern instead of one large block:
///
/// ```rust,ignore
/// builder
///     .add_provider(&DatabaseProvider::from_env())?
///     .add_provider(&AuthProvider)?
///     .add_provider(&AccountsProvider)?;
/// ```
pub trait Provider: Send + Sync {
    /// Registers this module's services. Called once per `add_provider`.
    fn register(&self, builder: &mut ContainerBuilder) -> Result<()>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
