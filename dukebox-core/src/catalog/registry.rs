//! The provider registry.
//!
//! An explicit object holding the uri -> provider mapping, mutated
//! through `register`/`unregister` and observed through a plain
//! synchronously-notified observer list. Nothing is wired up by
//! reflection or service discovery; the catalog subscribes and reacts.

use std::sync::{Arc, Mutex};

use tracing::info;

use super::backend::RepositoryProvider;
use crate::error::{Error, Result};

/// A registry change, delivered synchronously to observers.
#[derive(Clone)]
pub enum RegistryEvent {
    Registered(Arc<dyn RepositoryProvider>),
    Unregistered { uri: String },
}

type Observer = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

/// Holds the known repository providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<Vec<Arc<dyn RepositoryProvider>>>,
    observers: Mutex<Vec<Observer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider; rejects a second provider under the same uri.
    pub fn register(&self, provider: Arc<dyn RepositoryProvider>) -> Result<()> {
        {
            let mut providers = self.providers.lock().expect("registry poisoned");
            if providers.iter().any(|p| p.uri() == provider.uri()) {
                return Err(Error::DuplicateRepository {
                    uri: provider.uri().to_string(),
                });
            }
            providers.push(provider.clone());
        }
        info!(uri = provider.uri(), name = provider.name(), "provider registered");
        self.notify(&RegistryEvent::Registered(provider));
        Ok(())
    }

    /// Removes the provider under `uri`; unknown uris are an error.
    pub fn unregister(&self, uri: &str) -> Result<()> {
        {
            let mut providers = self.providers.lock().expect("registry poisoned");
            let before = providers.len();
            providers.retain(|p| p.uri() != uri);
            if providers.len() == before {
                return Err(Error::UnknownRepository {
                    uri: uri.to_string(),
                });
            }
        }
        info!(uri, "provider unregistered");
        self.notify(&RegistryEvent::Unregistered {
            uri: uri.to_string(),
        });
        Ok(())
    }

    /// Snapshot of the currently registered providers, in registration
    /// order.
    pub fn providers(&self) -> Vec<Arc<dyn RepositoryProvider>> {
        self.providers.lock().expect("registry poisoned").clone()
    }

    /// Adds an observer notified synchronously on every subsequent
    /// change.
    pub fn observe(&self, observer: impl Fn(&RegistryEvent) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("registry poisoned")
            .push(Box::new(observer));
    }

    fn notify(&self, event: &RegistryEvent) {
        let observers = self.observers.lock().expect("registry poisoned");
        for observer in observers.iter() {
            observer(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::backend::{BackendContext, RepositoryHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DummyProvider {
        uri: String,
    }

    impl RepositoryProvider for DummyProvider {
        fn uri(&self) -> &str {
            &self.uri
        }

        fn name(&self) -> &str {
            "dummy"
        }

        fn open(&self, _context: &BackendContext) -> Result<Box<dyn RepositoryHandle>> {
            Err(Error::UnknownRepository {
                uri: self.uri.clone(),
            })
        }
    }

    fn provider(uri: &str) -> Arc<dyn RepositoryProvider> {
        Arc::new(DummyProvider { uri: uri.into() })
    }

    #[test]
    fn register_unregister_round_trip() {
        let registry = ProviderRegistry::new();
        registry.register(provider("a")).unwrap();
        registry.register(provider("b")).unwrap();
        assert_eq!(registry.providers().len(), 2);

        registry.unregister("a").unwrap();
        assert_eq!(registry.providers().len(), 1);
        assert_eq!(registry.providers()[0].uri(), "b");
    }

    #[test]
    fn duplicate_uri_is_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(provider("a")).unwrap();
        assert!(matches!(
            registry.register(provider("a")),
            Err(Error::DuplicateRepository { .. })
        ));
    }

    #[test]
    fn unknown_unregister_is_an_error() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.unregister("nope"),
            Err(Error::UnknownRepository { .. })
        ));
    }

    #[test]
    fn observers_see_changes_synchronously() {
        let registry = ProviderRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        registry.observe(move |_event| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        registry.register(provider("a")).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        registry.unregister("a").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
