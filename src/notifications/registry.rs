//! Scheme to service factory mapping.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{NotificationService, ServiceContext};
use crate::notifications::url::normalize_scheme;

pub type ServiceFactory = Arc<dyn Fn(&ServiceContext) -> Box<dyn NotificationService> + Send + Sync>;

/// One registration: a friendly name, the schemes it answers to, and how to
/// build a fresh, unconfigured service.
#[derive(Clone)]
pub struct ServiceEntry {
    pub name: &'static str,
    pub schemes: &'static [&'static str],
    pub factory: ServiceFactory,
}

impl ServiceEntry {
    pub fn new<F>(name: &'static str, schemes: &'static [&'static str], factory: F) -> Self
    where
        F: Fn(&ServiceContext) -> Box<dyn NotificationService> + Send + Sync + 'static,
    {
        Self {
            name,
            schemes,
            factory: Arc::new(factory),
        }
    }
}

impl std::fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("name", &self.name)
            .field("schemes", &self.schemes)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("scheme '{0}' already registered")]
    DuplicateScheme(String),
    #[error("service '{0}' registers no schemes")]
    NoSchemes(String),
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    entries: RwLock<BTreeMap<String, ServiceEntry>>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<ServiceRegistry>> = OnceLock::new();

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry holding every built-in service.
    pub fn builtin() -> Self {
        let registry = Self::new();
        for entry in crate::services::builtin_entries() {
            if let Err(err) = registry.register(entry) {
                tracing::error!(event = "builtin_registration_failed", error = %err, "built-in service clashes");
            }
        }
        registry
    }

    /// The process-wide registry, populated with the built-ins on first use.
    pub fn global() -> Arc<ServiceRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(ServiceRegistry::builtin())))
    }

    /// Register every scheme of `entry`. Nothing is registered if any scheme
    /// is already taken.
    pub fn register(&self, entry: ServiceEntry) -> Result<(), RegistryError> {
        if entry.schemes.is_empty() {
            return Err(RegistryError::NoSchemes(entry.name.to_string()));
        }
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let schemes: Vec<String> = entry.schemes.iter().map(|s| normalize_scheme(s)).collect();
        if let Some(taken) = schemes.iter().find(|scheme| entries.contains_key(*scheme)) {
            return Err(RegistryError::DuplicateScheme(taken.clone()));
        }
        for scheme in schemes {
            entries.insert(scheme, entry.clone());
        }
        Ok(())
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.read().contains_key(&normalize_scheme(scheme))
    }

    /// Every registered scheme, aliases included, sorted.
    pub fn schemes(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn friendly_name(&self, scheme: &str) -> Option<&'static str> {
        self.read().get(&normalize_scheme(scheme)).map(|entry| entry.name)
    }

    /// Build a new, unconfigured service for `scheme`.
    pub fn instantiate(&self, scheme: &str, ctx: &ServiceContext) -> NotifyResult<Box<dyn NotificationService>> {
        let scheme = normalize_scheme(scheme);
        let factory = self
            .read()
            .get(&scheme)
            .map(|entry| Arc::clone(&entry.factory))
            .ok_or_else(|| NotifyError::UnknownScheme(scheme.clone()))?;
        Ok(factory(ctx))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ServiceEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::notifications::types::NotificationRequest;
    use crate::notifications::url::ServiceUrl;

    #[derive(Default)]
    struct NullService {
        target: String,
    }

    #[async_trait]
    impl NotificationService for NullService {
        fn id(&self) -> &'static str {
            "null"
        }

        fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
            self.target = url.host.clone();
            Ok(())
        }

        async fn send(&self, _request: &NotificationRequest) -> NotifyResult<()> {
            Ok(())
        }

        fn to_url(&self) -> String {
            format!("null://{}", self.target)
        }
    }

    fn null_entry(schemes: &'static [&'static str]) -> ServiceEntry {
        ServiceEntry::new("Null", schemes, |_| Box::new(NullService::default()))
    }

    #[test]
    fn aliases_resolve_to_one_entry() {
        let registry = ServiceRegistry::new();
        registry.register(null_entry(&["null", "void"])).unwrap();
        assert_eq!(registry.schemes(), vec!["null", "void"]);
        assert_eq!(registry.friendly_name("  VOID"), Some("Null"));
        assert!(registry.contains("Null"));
    }

    #[test]
    fn duplicate_schemes_are_rejected_atomically() {
        let registry = ServiceRegistry::new();
        registry.register(null_entry(&["null"])).unwrap();
        assert_eq!(
            registry.register(null_entry(&["other", "null"])),
            Err(RegistryError::DuplicateScheme("null".to_string()))
        );
        assert!(!registry.contains("other"));
        assert_eq!(
            registry.register(null_entry(&[])),
            Err(RegistryError::NoSchemes("Null".to_string()))
        );
    }

    #[test]
    fn factories_build_independent_services() {
        let registry = ServiceRegistry::new();
        registry.register(null_entry(&["null"])).unwrap();
        let ctx = ServiceContext::new(Arc::new(crate::http::HttpPools::new()));
        let mut first = registry.instantiate("null", &ctx).unwrap();
        let second = registry.instantiate("null", &ctx).unwrap();
        first.parse_url(&ServiceUrl::parse("null://a").unwrap()).unwrap();
        assert_eq!(first.to_url(), "null://a");
        assert_eq!(second.to_url(), "null://");
        assert!(matches!(
            registry.instantiate("nope", &ctx),
            Err(NotifyError::UnknownScheme(scheme)) if scheme == "nope"
        ));
    }

    #[test]
    fn builtin_registry_covers_aliases() {
        let registry = ServiceRegistry::builtin();
        for scheme in [
            "discord", "slack", "tgram", "telegram", "json", "jsons", "webhook", "webhooks", "mailto",
            "mailtos", "pushover", "ntfy", "ntfys", "gotify", "gotifys", "matrix", "matrixs",
            "aws-sns-sms", "sns", "o365", "outlook365", "twilio",
        ] {
            assert!(registry.contains(scheme), "missing {scheme}");
        }
        assert_eq!(registry.friendly_name("telegram"), registry.friendly_name("tgram"));
    }
}
