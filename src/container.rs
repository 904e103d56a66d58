//! Service providers and the container that instantiates them.
//!
//! Handlers that need a shared service (a database pool, a mailer) resolve it
//! by name through the [`Container`] attached to the pipeline. Each service
//! moves through three states:
//!
//! ```text
//! Unregistered ──bind──▶ Registered(factory) ──first make──▶ Instantiated(value)
//!                              │                                   ▲
//!                              └──── bind, when !is_defer() ───────┘
//! ```
//!
//! Instantiation runs `boot`, then the factory, at most once per service even
//! under concurrent lookups. A failed `boot` or factory call fails only that
//! lookup; the service stays `Registered` and the next lookup tries again.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::Error;

/// A constructed service, shared by every handler that resolves it.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// An argument handed to a provider's factory.
pub type Param = Arc<dyn Any + Send + Sync>;

/// Builds a service from the provider's [`params`](ServiceProvider::params).
pub type NewInstance =
    Box<dyn Fn(&[Param]) -> Result<Instance, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Describes how to build one named service.
pub trait ServiceProvider: Send + Sync + 'static {
    /// Returns the factory. Called once, when the provider is bound.
    fn register(&self, container: &Container) -> NewInstance;

    /// Preparation run right before the factory: configuration, defaults.
    /// An error aborts this instantiation.
    fn boot(&self, container: &Container) -> Result<(), Error>;

    /// `false` instantiates at bind time, `true` on first lookup.
    fn is_defer(&self) -> bool;

    /// Arguments for the factory.
    fn params(&self, container: &Container) -> Vec<Param>;

    /// The name the service is resolved by.
    fn name(&self) -> &str;
}

/// Lifecycle of a named service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceState {
    Unregistered,
    Registered,
    Instantiated,
}

struct Entry {
    provider: Box<dyn ServiceProvider>,
    factory: NewInstance,
    instance: OnceCell<Instance>,
}

/// Registry of service providers.
#[derive(Default)]
pub struct Container {
    services: RwLock<HashMap<String, Arc<Entry>>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider`, replacing any provider of the same name.
    ///
    /// Non-deferred providers are instantiated immediately; their failure is
    /// returned here but the provider stays registered.
    pub fn bind(&self, provider: impl ServiceProvider) -> Result<(), Error> {
        let name = provider.name().to_owned();
        let factory = provider.register(self);
        let eager = !provider.is_defer();
        let entry = Arc::new(Entry {
            provider: Box::new(provider),
            factory,
            instance: OnceCell::new(),
        });

        if self.services.write().insert(name.clone(), Arc::clone(&entry)).is_some() {
            debug!(service = %name, "provider replaced");
        }

        if eager {
            self.instantiate(&name, &entry)?;
        }
        Ok(())
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    pub fn state(&self, name: &str) -> ServiceState {
        match self.services.read().get(name) {
            None => ServiceState::Unregistered,
            Some(entry) if entry.instance.get().is_some() => ServiceState::Instantiated,
            Some(_) => ServiceState::Registered,
        }
    }

    /// Resolves `name` as an untyped instance, instantiating it if needed.
    pub fn make_any(&self, name: &str) -> Result<Instance, Error> {
        // Clone the entry out so the map lock is not held while the factory
        // runs; factories may resolve other services.
        let entry = self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_owned()))?;
        self.instantiate(name, &entry)
    }

    /// Resolves `name` as a concrete type.
    pub fn make<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, Error> {
        self.make_any(name)?
            .downcast::<T>()
            .map_err(|_| Error::ServiceType(name.to_owned()))
    }

    fn instantiate(&self, name: &str, entry: &Entry) -> Result<Instance, Error> {
        entry.instance
            .get_or_try_init(|| {
                entry.provider.boot(self).map_err(|e| Error::ServiceBoot {
                    name: name.to_owned(),
                    source: Box::new(e),
                })?;
                let params = entry.provider.params(self);
                let instance = (entry.factory)(&params).map_err(|source| Error::ServiceInit {
                    name: name.to_owned(),
                    source,
                })?;
                debug!(service = %name, "service instantiated");
                Ok(instance)
            })
            .cloned()
            .inspect_err(|e| warn!(service = %name, error = %e, "service instantiation failed"))
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.services.read();
        let mut names: Vec<_> = services.keys().collect();
        names.sort();
        f.debug_struct("Container").field("services", &names).finish()
    }
}
