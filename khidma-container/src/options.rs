//! Container options.
//!
//! Options tune how a container validates and resolves; they never describe
//! what is registered. They can be built in code or deserialized from any
//! serde format:
//!
//! ```
//! use khidma_container::options::ContainerOptions;
//!
//! let options = ContainerOptions {
//!     resolve_timeout_ms: Some(250),
//!     ..ContainerOptions::default()
//! };
//! assert!(options.validate_on_build);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Default ceiling for nested resolutions.
pub const DEFAULT_MAX_RESOLUTION_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerOptions {
    /// Check the declared dependency graph in `build()`.
    pub validate_on_build: bool,

    /// Longest chain of nested resolutions before
    /// [`ResolutionTooDeep`](crate::error::KhidmaError::ResolutionTooDeep).
    pub max_resolution_depth: usize,

    /// Upper bound for every top-level resolve, in milliseconds.
    pub resolve_timeout_ms: Option<u64>,
}

impl ContainerOptions {
    pub fn resolve_timeout(&self) -> Option<Duration> {
        self.resolve_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            validate_on_build: true,
            max_resolution_depth: DEFAULT_MAX_RESOLUTION_DEPTH,
            resolve_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let options: ContainerOptions = serde_json::from_str(r#"{ "resolve_timeout_ms": 1500 }"#).unwrap();

        assert!(options.validate_on_build);
        assert_eq!(options.max_resolution_depth, DEFAULT_MAX_RESOLUTION_DEPTH);
        assert_eq!(options.resolve_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn empty_object_is_default() {
        let options: ContainerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, ContainerOptions::default());
        assert_eq!(options.resolve_timeout(), None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<ContainerOptions>(r#"{ "validate": false }"#);
        assert!(result.is_err());
    }
}
