//! # Khidma: a dependency injection runtime for Rust services
//!
//! Services are registered as recipes with a lifetime (singleton, scoped or
//! transient), resolved asynchronously with their dependencies built depth
//! first, and scoped instances live and die with a per-request [`Scope`].
//!
//! ```rust
//! use std::sync::Arc;
//! use khidma::prelude::*;
//!
//! struct Engine;
//! struct Session {
//!     engine: Arc<Engine>,
//! }
//!
//! impl Injectable for Session {
//!     type Deps = (Arc<Engine>,);
//!
//!     fn construct((engine,): Self::Deps) -> std::result::Result<Self, BoxError> {
//!         Ok(Session { engine })
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut builder = Container::builder();
//! builder
//!     .register_singleton(Recipe::value(Engine))?
//!     .register_scoped(Recipe::<Session>::construct())?;
//! let container = builder.build()?;
//!
//! let session = container
//!     .in_scope(|scope| async move { scope.resolve::<Session>().await })
//!     .await?;
//! assert!(Arc::ptr_eq(&session.engine, &container.resolve::<Engine>().await?));
//! # Ok::<(), KhidmaError>(())
//! # }).unwrap();
//! ```

pub use khidma_container::*;
pub use khidma_support::{logging, rendering};
