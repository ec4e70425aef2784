//! Dependency graph validation.
//!
//! Validates the declared dependency graph at build time:
//! - Checks that every required dependency is registered
//! - Detects circular dependencies
//! - Rejects singletons that reach a scoped service
//!
//! All validation happens during [`ContainerBuilder::build()`](crate::container::ContainerBuilder::build),
//! before the first `resolve()` call. Only declared edges are visible here;
//! what an async factory resolves on its own is checked at runtime.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, warn};

use crate::error::{CyclicDependencyError, KhidmaError, NotRegisteredError, Result, ScopeMismatchError};
use crate::key::ServiceKey;
use crate::lifetime::Lifetime;
use crate::registry::similar_keys;

/// What the validator needs to know about one registration.
#[derive(Debug, Clone)]
pub(crate) struct DependencyInfo {
    /// What this recipe produces
    pub key: ServiceKey,
    /// Required dependencies it declares
    pub dependencies: Vec<ServiceKey>,
    pub lifetime: Lifetime,
}

/// Validates the dependency graph.
///
/// # Algorithm
/// Depth-first search with a "visiting" set for cycles and missing keys,
/// then a memoized walk from every singleton through transient
/// dependencies looking for a scoped one.
pub(crate) struct GraphValidator {
    dependencies: HashMap<ServiceKey, DependencyInfo>,
    /// Currently being visited (for cycle detection)
    visiting: HashSet<ServiceKey>,
    /// Already validated
    validated: HashSet<ServiceKey>,
    /// Current DFS path (for error reporting)
    path: Vec<ServiceKey>,
}

impl GraphValidator {
    pub fn new(dependencies: HashMap<ServiceKey, DependencyInfo>) -> Self {
        Self {
            dependencies,
            visiting: HashSet::new(),
            validated: HashSet::new(),
            path: Vec::new(),
        }
    }

    /// Validates the entire graph.
    ///
    /// # Errors
    /// - [`KhidmaError::ServiceNotRegistered`]: missing dependency
    /// - [`KhidmaError::CyclicDependency`]: cycle detected
    /// - [`KhidmaError::ScopeMismatch`]: singleton captures a scoped service
    #[instrument(skip(self), name = "graph_validation")]
    pub fn validate(&mut self) -> Result<()> {
        let mut keys: Vec<ServiceKey> = self.dependencies.keys().cloned().collect();
        keys.sort_by_key(|k| (k.type_name(), k.name()));

        debug!(services = keys.len(), "Validating dependency graph");

        for key in &keys {
            if !self.validated.contains(key) {
                self.validate_key(key)?;
            }
        }

        self.check_lifetimes(&keys)?;

        debug!("Dependency graph is valid");
        Ok(())
    }

    /// Recursive DFS over one key.
    fn validate_key(&mut self, key: &ServiceKey) -> Result<()> {
        if self.validated.contains(key) {
            return Ok(());
        }

        if self.visiting.contains(key) {
            let start = self.path.iter().position(|k| k == key).unwrap_or(0);
            let mut chain = self.path[start..].to_vec();
            chain.push(key.clone());

            warn!(cycle = ?chain, "Cyclic dependency detected");
            return Err(KhidmaError::CyclicDependency(CyclicDependencyError { chain }));
        }

        let Some(info) = self.dependencies.get(key).cloned() else {
            return Err(KhidmaError::ServiceNotRegistered(NotRegisteredError {
                requested: key.clone(),
                required_by: self.path.last().cloned(),
                suggestions: similar_keys(key, self.dependencies.keys()),
            }));
        };

        self.visiting.insert(key.clone());
        self.path.push(key.clone());

        for dependency in &info.dependencies {
            self.validate_key(dependency)?;
        }

        self.path.pop();
        self.visiting.remove(key);
        self.validated.insert(key.clone());
        Ok(())
    }

    /// A singleton is built without a scope and outlives every scope, so it
    /// must not reach a scoped service, directly or through transients.
    ///
    /// Runs after the DFS, so the graph is complete and acyclic here.
    fn check_lifetimes(&self, keys: &[ServiceKey]) -> Result<()> {
        let mut reach: HashMap<ServiceKey, Option<ServiceKey>> = HashMap::new();

        for key in keys {
            let Some(info) = self.dependencies.get(key) else {
                continue;
            };
            if info.lifetime != Lifetime::Singleton {
                continue;
            }

            for dependency in &info.dependencies {
                if let Some(scoped) = self.scoped_reach(dependency, &mut reach) {
                    warn!(
                        consumer = %info.key,
                        dependency = %scoped,
                        "Scope mismatch detected"
                    );
                    return Err(KhidmaError::ScopeMismatch(ScopeMismatchError {
                        consumer: info.key.clone(),
                        dependency: scoped,
                    }));
                }
            }
        }

        Ok(())
    }

    /// The scoped service building `key` would reach, if any.
    fn scoped_reach(
        &self,
        key: &ServiceKey,
        reach: &mut HashMap<ServiceKey, Option<ServiceKey>>,
    ) -> Option<ServiceKey> {
        if let Some(known) = reach.get(key) {
            return known.clone();
        }

        let info = self.dependencies.get(key)?;
        let found = match info.lifetime {
            Lifetime::Scoped => Some(key.clone()),
            // Checked as a consumer on its own.
            Lifetime::Singleton => None,
            Lifetime::Transient => info
                .dependencies
                .iter()
                .find_map(|dependency| self.scoped_reach(dependency, reach)),
        };

        reach.insert(key.clone(), found.clone());
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep_info(key: ServiceKey, lifetime: Lifetime, deps: Vec<ServiceKey>) -> DependencyInfo {
        DependencyInfo {
            key,
            dependencies: deps,
            lifetime,
        }
    }

    fn make_graph(infos: Vec<DependencyInfo>) -> HashMap<ServiceKey, DependencyInfo> {
        infos.into_iter().map(|i| (i.key.clone(), i)).collect()
    }

    struct Engine;
    struct SessionFactory;
    struct Session;
    struct UserRepository;
    struct UserService;

    #[test]
    fn valid_request_graph() {
        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<Engine>(), Lifetime::Singleton, vec![]),
            dep_info(
                ServiceKey::of::<SessionFactory>(),
                Lifetime::Singleton,
                vec![ServiceKey::of::<Engine>()],
            ),
            dep_info(
                ServiceKey::of::<Session>(),
                Lifetime::Scoped,
                vec![ServiceKey::of::<SessionFactory>()],
            ),
            dep_info(
                ServiceKey::of::<UserService>(),
                Lifetime::Transient,
                vec![ServiceKey::of::<Session>()],
            ),
        ]);

        assert!(GraphValidator::new(graph).validate().is_ok());
    }

    #[test]
    fn detect_cycle() {
        // A → B → C → A
        struct A;
        struct B;
        struct C;

        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<A>(), Lifetime::Transient, vec![ServiceKey::of::<B>()]),
            dep_info(ServiceKey::of::<B>(), Lifetime::Transient, vec![ServiceKey::of::<C>()]),
            dep_info(ServiceKey::of::<C>(), Lifetime::Transient, vec![ServiceKey::of::<A>()]),
        ]);

        match GraphValidator::new(graph).validate() {
            Err(KhidmaError::CyclicDependency(err)) => {
                assert_eq!(err.chain.len(), 4);
                assert_eq!(err.chain.first(), err.chain.last());
            }
            other => panic!("Expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn detect_self_dependency() {
        struct A;

        let graph = make_graph(vec![dep_info(
            ServiceKey::of::<A>(),
            Lifetime::Transient,
            vec![ServiceKey::of::<A>()],
        )]);

        assert!(matches!(
            GraphValidator::new(graph).validate(),
            Err(KhidmaError::CyclicDependency(_))
        ));
    }

    #[test]
    fn detect_missing_dependency() {
        let graph = make_graph(vec![dep_info(
            ServiceKey::of::<UserService>(),
            Lifetime::Transient,
            vec![ServiceKey::of::<UserRepository>()],
        )]);

        match GraphValidator::new(graph).validate() {
            Err(KhidmaError::ServiceNotRegistered(err)) => {
                assert_eq!(err.requested, ServiceKey::of::<UserRepository>());
                assert_eq!(err.required_by, Some(ServiceKey::of::<UserService>()));
            }
            other => panic!("Expected ServiceNotRegistered, got: {other:?}"),
        }
    }

    #[test]
    fn singleton_on_scoped_is_rejected() {
        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<Session>(), Lifetime::Scoped, vec![]),
            dep_info(
                ServiceKey::of::<UserRepository>(),
                Lifetime::Singleton,
                vec![ServiceKey::of::<Session>()],
            ),
        ]);

        match GraphValidator::new(graph).validate() {
            Err(KhidmaError::ScopeMismatch(err)) => {
                assert_eq!(err.consumer, ServiceKey::of::<UserRepository>());
                assert_eq!(err.dependency, ServiceKey::of::<Session>());
            }
            other => panic!("Expected ScopeMismatch, got: {other:?}"),
        }
    }

    #[test]
    fn singleton_reaching_scoped_through_transient_is_rejected() {
        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<Session>(), Lifetime::Scoped, vec![]),
            dep_info(
                ServiceKey::of::<UserRepository>(),
                Lifetime::Transient,
                vec![ServiceKey::of::<Session>()],
            ),
            dep_info(
                ServiceKey::of::<UserService>(),
                Lifetime::Singleton,
                vec![ServiceKey::of::<UserRepository>()],
            ),
        ]);

        match GraphValidator::new(graph).validate() {
            Err(KhidmaError::ScopeMismatch(err)) => {
                assert_eq!(err.consumer, ServiceKey::of::<UserService>());
                assert_eq!(err.dependency, ServiceKey::of::<Session>());
            }
            other => panic!("Expected ScopeMismatch, got: {other:?}"),
        }
    }

    #[test]
    fn singleton_on_transient_is_fine() {
        // The transient is built fresh for the singleton and owned by it.
        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<Engine>(), Lifetime::Transient, vec![]),
            dep_info(
                ServiceKey::of::<UserService>(),
                Lifetime::Singleton,
                vec![ServiceKey::of::<Engine>()],
            ),
        ]);

        assert!(GraphValidator::new(graph).validate().is_ok());
    }

    #[test]
    fn scoped_on_singleton_is_fine() {
        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<Engine>(), Lifetime::Singleton, vec![]),
            dep_info(
                ServiceKey::of::<Session>(),
                Lifetime::Scoped,
                vec![ServiceKey::of::<Engine>()],
            ),
        ]);

        assert!(GraphValidator::new(graph).validate().is_ok());
    }

    #[test]
    fn diamond_dependency_ok() {
        //     A
        //    / \
        //   B   C
        //    \ /
        //     D
        struct A;
        struct B;
        struct C;
        struct D;

        let graph = make_graph(vec![
            dep_info(ServiceKey::of::<D>(), Lifetime::Singleton, vec![]),
            dep_info(ServiceKey::of::<B>(), Lifetime::Transient, vec![ServiceKey::of::<D>()]),
            dep_info(ServiceKey::of::<C>(), Lifetime::Transient, vec![ServiceKey::of::<D>()]),
            dep_info(
                ServiceKey::of::<A>(),
                Lifetime::Singleton,
                vec![ServiceKey::of::<B>(), ServiceKey::of::<C>()],
            ),
        ]);

        assert!(GraphValidator::new(graph).validate().is_ok());
    }
}
