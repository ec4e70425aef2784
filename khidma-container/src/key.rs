//! Service identification keys.
//!
//! A [`ServiceKey`] is a [`TypeId`] plus an optional name, so one type can be
//! registered several times under different names.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

use khidma_support::rendering::shorten_type_name;

/// Uniquely identifies a service in the registry.
///
/// Keys are usually the abstract type a consumer asks for, which may be a
/// trait object:
///
/// ```
/// use khidma_container::key::ServiceKey;
///
/// trait PasswordHasher {}
///
/// let key = ServiceKey::of::<dyn PasswordHasher>();
/// assert!(key.type_name().contains("PasswordHasher"));
/// assert_eq!(key.name(), None);
///
/// let primary = ServiceKey::named::<String>("primary_dsn");
/// assert_ne!(primary, ServiceKey::of::<String>());
/// ```
#[derive(Clone)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<&'static str>,
}

impl ServiceKey {
    /// Key for type `T`.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            name: None,
        }
    }

    /// Key for type `T` under `name`.
    #[inline]
    pub fn named<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            name: Some(name),
        }
    }

    /// Same type, different name.
    #[inline]
    pub(crate) fn with_name(mut self, name: Option<&'static str>) -> Self {
        self.name = name;
        self
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified type name, as reported by [`std::any::type_name`].
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[inline]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Type name without module paths, for messages.
    pub fn short_name(&self) -> String {
        match self.name {
            Some(name) => format!("{}[{name}]", shorten_type_name(self.type_name)),
            None => shorten_type_name(self.type_name),
        }
    }
}

// equality ignores type_name: TypeId already identifies the type
impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "ServiceKey({}, name={:?})", self.type_name, name),
            None => write!(f, "ServiceKey({})", self.type_name),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "{} (name={:?})", self.type_name, name),
            None => write!(f, "{}", self.type_name),
        }
    }
}
