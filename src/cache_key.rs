use std::fmt;
use std::sync::Arc;

/// The identity of one cached value.
///
/// A key is formed from the resource-family name and the input value rendered
/// to a string, separated by a colon. The rendered form must be **stable**:
/// two inputs that render identically are the same cached value, and an input
/// whose rendering changes between calls would silently miss its own entry.
///
/// Keys are cheap to clone and compare.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    raw: Arc<str>,
}

impl CacheKey {
    /// Creates a [`CacheKey`] for the given resource family and input.
    pub fn new(family: &str, input: &impl fmt::Display) -> Self {
        Self {
            raw: format!("{family}:{input}").into(),
        }
    }

    /// Returns the full rendered key, `family:input`.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
