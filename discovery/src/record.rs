use std::fmt;

const BACKEND_SEGMENT: &str = "/backend/";

/// A backend registration as observed in the coordination store.
///
/// Never mutated after construction; a later PUT for the same instance
/// replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendRecord {
    pub instance_id: String,
    pub address: String,
}

impl BackendRecord {
    pub fn new(instance_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for BackendRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.instance_id, self.address)
    }
}

/// Registration key layout: `{prefix}/backend/{instance_id}`.
///
/// The prefix is used verbatim, so `svc/` yields `svc//backend/`. Every
/// process sharing a pool must configure the same prefix string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    registration_prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        Self {
            registration_prefix: format!("{}{}", prefix, BACKEND_SEGMENT),
        }
    }

    /// Prefix every registration key starts with (includes the trailing `/`).
    pub fn registration_prefix(&self) -> &str {
        &self.registration_prefix
    }

    pub fn key_for(&self, instance_id: &str) -> String {
        format!("{}{}", self.registration_prefix, instance_id)
    }

    /// Recover the instance id from a registration key.
    ///
    /// Returns `None` for keys outside the prefix, empty ids, or ids that
    /// contain a path separator.
    pub fn instance_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(self.registration_prefix.as_str())?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }

    pub fn record(&self, key: &str, value: &str) -> Option<BackendRecord> {
        self.instance_id(key)
            .map(|id| BackendRecord::new(id, value))
    }
}
