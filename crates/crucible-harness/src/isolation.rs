//! Isolation keys.
//!
//! An isolation key partitions the data one test creates inside a shared
//! environment. It is the tenant every operation of the test's client is
//! tagged with.

use std::fmt;

/// Maximum length of an isolation key, in characters.
pub const MAX_ISOLATION_KEY_LEN: usize = 30;

/// Placeholder for a missing class or method name.
const MISSING_NAME: &str = "?";

/// Deterministic tenant identifier of one test.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolationKey(String);

impl IsolationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IsolationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `<class>_<method>`, cut after [`MAX_ISOLATION_KEY_LEN`] characters.
///
/// Pairs sharing a 30 character prefix map to the same key.
pub fn derive_isolation_key(class_name: Option<&str>, method_name: Option<&str>) -> IsolationKey {
    let class_name = class_name.filter(|s| !s.is_empty()).unwrap_or(MISSING_NAME);
    let method_name = method_name.filter(|s| !s.is_empty()).unwrap_or(MISSING_NAME);

    let key = format!("{class_name}_{method_name}")
        .chars()
        .take(MAX_ISOLATION_KEY_LEN)
        .collect();

    IsolationKey(key)
}
