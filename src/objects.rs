//! Lazily built, per-connection shared objects (DNS resolver, SPF/DKIM
//! verifier, parsed policy state) with a per-entry destroy policy.
//!
//! `resolver` and `spf_server` are built once and reused across every
//! message of the connection; destroyable entries are reaped between
//! messages.

use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

use tracing::trace;

use crate::{config::Config, handlers::HandlerError};

pub type SharedObject = Arc<dyn Any + Send + Sync>;
pub type ObjectFactory =
    Box<dyn Fn(&Config) -> Result<SharedObject, HandlerError> + Send + Sync>;

struct StoredObject {
    object: SharedObject,
    destroy: bool,
}

#[derive(Default)]
pub struct ObjectStore {
    objects: HashMap<String, StoredObject>,
    factories: HashMap<String, (ObjectFactory, bool)>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named factory. `destroy` tags whether the built object is
    /// reaped between messages.
    pub fn register_factory(&mut self, name: impl Into<String>, destroy: bool, factory: ObjectFactory) {
        self.factories.insert(name.into(), (factory, destroy));
    }

    /// Store an already built object.
    pub fn set(&mut self, name: impl Into<String>, object: SharedObject, destroy: bool) {
        self.objects.insert(name.into(), StoredObject { object, destroy });
    }

    /// Fetch an object, building it through its registered factory on first
    /// use. A name with no stored object and no factory yields `None`.
    pub fn get(&mut self, name: &str, config: &Config) -> Result<Option<SharedObject>, HandlerError> {
        if let Some(stored) = self.objects.get(name) {
            return Ok(Some(stored.object.clone()));
        }

        let Some((factory, destroy)) = self.factories.get(name) else {
            return Ok(None);
        };

        trace!(name, "building shared object");
        let object = factory(config)?;
        let destroy = *destroy;
        self.objects.insert(
            name.to_string(),
            StoredObject {
                object: object.clone(),
                destroy,
            },
        );

        Ok(Some(object))
    }

    /// Typed fetch; a stored object of the wrong type is a handler bug.
    pub fn get_typed<T: Send + Sync + 'static>(
        &mut self,
        name: &str,
        config: &Config,
    ) -> Result<Option<Arc<T>>, HandlerError> {
        match self.get(name, config)? {
            Some(object) => object
                .downcast::<T>()
                .map(Some)
                .map_err(|_| HandlerError::Internal(format!("object {name} has unexpected type"))),
            None => Ok(None),
        }
    }

    /// Reap destroyable objects between messages.
    pub fn destroy_objects(&mut self) {
        self.objects.retain(|name, stored| {
            if stored.destroy {
                trace!(name, "destroying shared object");
            }
            !stored.destroy
        });
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn factory_builds_lazily_and_caches() {
        let config = Config::default();
        let mut store = ObjectStore::new();
        let builds = Arc::new(AtomicUsize::new(0));

        let counter = builds.clone();
        store.register_factory(
            "resolver",
            false,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(42u32) as SharedObject)
            }),
        );

        assert_eq!(builds.load(Ordering::SeqCst), 0);
        let first = store.get_typed::<u32>("resolver", &config).unwrap().unwrap();
        let second = store.get_typed::<u32>("resolver", &config).unwrap().unwrap();
        assert_eq!(*first, 42);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_name_yields_nothing() {
        let config = Config::default();
        let mut store = ObjectStore::new();
        assert!(store.get("dmarc_state", &config).unwrap().is_none());
    }

    #[test]
    fn destroyable_objects_are_reaped() {
        let config = Config::default();
        let mut store = ObjectStore::new();
        store.set("resolver", Arc::new(1u32), false);
        store.set("dmarc_state", Arc::new(2u32), true);

        store.destroy_objects();
        assert!(store.get("resolver", &config).unwrap().is_some());
        assert!(store.get("dmarc_state", &config).unwrap().is_none());
    }
}
