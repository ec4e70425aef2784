//! Core container implementation for Khidma.
//!
//! Registration ([`ContainerBuilder`](container::ContainerBuilder)),
//! resolution ([`Container`](container::Container)), request scopes
//! ([`Scope`](scope::Scope)) and the [`Injector`](injector::Injector).

pub mod container;
pub mod dependency;
pub mod dispose;
pub mod error;
mod graph;
mod inflight;
pub mod injector;
pub mod key;
pub mod lifetime;
pub mod options;
pub mod provider;
pub mod recipe;
mod registry;
pub mod resolution;
pub mod scope;

pub use container::{Container, ContainerBuilder, prelude};
pub use error::{BoxError, KhidmaError, Result};
pub use key::ServiceKey;
pub use lifetime::Lifetime;
pub use registry::BoxFuture;
pub use scope::{Scope, ScopeStack};
