use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::error::ServerError;
use crate::server::matcher::RequestMatcher;

/// What the server reads before handing a registered call to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadHandling {
    /// Deliver the call as soon as its initial metadata has arrived.
    #[default]
    None,
    /// Read the first request message and deliver it with the call.
    ReadInitialPayload,
}

/// A composite key for method registration: (method, host).
///
/// A `None` host matches any authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct MethodKey {
    pub method: String,
    pub host: Option<String>,
}

impl MethodKey {
    pub(crate) fn new(method: impl Into<String>, host: Option<&str>) -> Self {
        Self {
            method: method.into(),
            host: host.map(str::to_string),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}@{}", self.method, host),
            None => write!(f, "{}@*", self.method),
        }
    }
}

pub(crate) struct MethodEntry {
    key: MethodKey,
    payload_handling: PayloadHandling,
    matcher: OnceLock<Arc<RequestMatcher>>,
}

impl MethodEntry {
    pub(crate) fn payload_handling(&self) -> PayloadHandling {
        self.payload_handling
    }

    /// Set once when the server starts.
    pub(crate) fn matcher(&self) -> Option<&Arc<RequestMatcher>> {
        self.matcher.get()
    }

    pub(crate) fn install_matcher(&self, matcher: RequestMatcher) {
        let _ = self.matcher.set(Arc::new(matcher));
    }
}

/// Handle to a method registered with a server, used to request calls for it.
#[derive(Clone)]
pub struct RegisteredMethod {
    entry: Arc<MethodEntry>,
}

impl RegisteredMethod {
    pub fn method(&self) -> &str {
        &self.entry.key.method
    }

    /// `None` for a method served on every host.
    pub fn host(&self) -> Option<&str> {
        self.entry.key.host.as_deref()
    }

    pub fn payload_handling(&self) -> PayloadHandling {
        self.entry.payload_handling
    }

    pub(crate) fn entry(&self) -> &Arc<MethodEntry> {
        &self.entry
    }
}

impl fmt::Debug for RegisteredMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("key", &self.entry.key)
            .field("payload_handling", &self.entry.payload_handling)
            .finish()
    }
}

/// Registered methods of one server.
pub(crate) struct MethodRegistry {
    methods: DashMap<MethodKey, Arc<MethodEntry>, ahash::RandomState>,
}

impl MethodRegistry {
    pub(crate) fn new() -> Self {
        Self {
            methods: DashMap::default(),
        }
    }

    /// Register `key`. Fails if the same (method, host) pair is already taken.
    pub(crate) fn register(
        &self,
        key: MethodKey,
        payload_handling: PayloadHandling,
    ) -> Result<RegisteredMethod, ServerError> {
        use dashmap::mapref::entry::Entry;

        match self.methods.entry(key.clone()) {
            Entry::Occupied(_) => Err(ServerError::MethodAlreadyRegistered {
                method: key.method,
                host: key.host,
            }),
            Entry::Vacant(slot) => {
                let entry = Arc::new(MethodEntry {
                    key,
                    payload_handling,
                    matcher: OnceLock::new(),
                });
                slot.insert(Arc::clone(&entry));
                Ok(RegisteredMethod { entry })
            }
        }
    }

    /// Exact (method, host) first, then the method registered for any host.
    pub(crate) fn lookup(&self, method: &str, host: Option<&str>) -> Option<Arc<MethodEntry>> {
        if let Some(host) = host {
            if let Some(entry) = self.methods.get(&MethodKey::new(method, Some(host))) {
                return Some(Arc::clone(entry.value()));
            }
        }
        self.methods
            .get(&MethodKey::new(method, None))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn entries(&self) -> Vec<Arc<MethodEntry>> {
        self.methods.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.methods.len()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods.len())
            .finish()
    }
}
