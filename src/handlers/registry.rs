//! Loads the configured handler chain and routes events to it.
//!
//! The registry never re-orders handlers: the configured order is the
//! dispatch order, and dependency validation only checks that prerequisites
//! appear earlier in the chain.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use thiserror::Error;
use tracing::debug;

use crate::{
    config::Config,
    handlers::{
        AddId, AlignedFrom, Auth, Dkim, Dmarc, Event, Handler, IpRev, LocalIp, Ptr, ReturnOk,
        Sanitize, SenderId, Size, Spf, Tls, TrustedIp,
    },
    headers::{AuthFragment, FragmentSorter},
    metrics::MetricsRegistry,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown handler {0:?} in load_handlers")]
    UnknownHandler(String),
    #[error("handler {handler:?} requires {requirement:?} earlier in the chain")]
    MissingRequirement { handler: String, requirement: String },
    #[error("invalid configuration for handler {handler:?}: {message}")]
    HandlerConfig { handler: String, message: String },
}

pub struct Registry {
    handlers: Vec<Arc<dyn Handler>>,
    by_name: HashMap<String, usize>,
    callbacks_list: HashMap<Event, Vec<usize>>,
}

fn build_handler(name: &str, config: &Config) -> Result<Arc<dyn Handler>, RegistryError> {
    let section = config.handler_config(name);
    let handler: Arc<dyn Handler> = match name {
        "AddID" => Arc::new(AddId::new()),
        "AlignedFrom" => Arc::new(AlignedFrom::new()),
        "Auth" => Arc::new(Auth::new()),
        "DKIM" => Arc::new(Dkim::from_config(&section)?),
        "DMARC" => Arc::new(Dmarc::from_config(&section)?),
        "IPrev" => Arc::new(IpRev::from_config(&section)?),
        "LocalIP" => Arc::new(LocalIp::new()),
        "PTR" => Arc::new(Ptr::new()),
        "ReturnOK" => Arc::new(ReturnOk::new()),
        "Sanitize" => Arc::new(Sanitize::new()),
        "SenderID" => Arc::new(SenderId::new()),
        "Size" => Arc::new(Size::from_config(&section)?),
        "SPF" => Arc::new(Spf::from_config(&section)?),
        "TLS" => Arc::new(Tls::new()),
        "TrustedIP" => Arc::new(TrustedIp::from_config(&section)?),
        "XGoogleDKIM" => Arc::new(crate::handlers::XGoogleDkim::new()),
        _ => return Err(RegistryError::UnknownHandler(name.to_string())),
    };
    Ok(handler)
}

impl Registry {
    /// Build the chain listed in `load_handlers`, in that order.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        let mut by_name = HashMap::new();

        for name in &config.load_handlers {
            let handler = build_handler(name, config)?;
            for requirement in handler.requires() {
                if !by_name.contains_key(*requirement) {
                    return Err(RegistryError::MissingRequirement {
                        handler: name.clone(),
                        requirement: requirement.to_string(),
                    });
                }
            }
            debug!("loaded handler {name}");
            by_name.insert(name.clone(), handlers.len());
            handlers.push(handler);
        }

        let mut callbacks_list: HashMap<Event, Vec<usize>> = HashMap::new();
        for event in Event::ALL {
            let list = handlers
                .iter()
                .enumerate()
                .filter(|(_, handler)| handler.callbacks().contains(&event))
                .map(|(index, _)| index)
                .collect();
            callbacks_list.insert(event, list);
        }

        Ok(Self {
            handlers,
            by_name,
            callbacks_list,
        })
    }

    /// The handlers subscribed to `event`, in configured order.
    pub fn get_callbacks(&self, event: Event) -> Vec<Arc<dyn Handler>> {
        self.callbacks_list
            .get(&event)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&index| self.handlers[index].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn handler(&self, name: &str) -> Option<&Arc<dyn Handler>> {
        self.by_name.get(name).map(|&index| &self.handlers[index])
    }

    /// Let every loaded handler register its metrics.
    pub fn register_metrics(&self, registry: &MetricsRegistry) {
        for handler in &self.handlers {
            handler.register_metrics(registry);
        }
    }
}

impl FragmentSorter for Registry {
    fn sort_same_key(&self, key: &str, a: &AuthFragment, b: &AuthFragment) -> Option<Ordering> {
        self.handlers
            .iter()
            .find(|handler| handler.can_sort_header(key))
            .map(|handler| handler.handler_header_sort(a, b))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config_with(handlers: &[&str]) -> Config {
        let mut config = Config::default();
        config.load_handlers = handlers.iter().map(|s| s.to_string()).collect();
        config
    }

    #[test]
    fn loads_handlers_in_configured_order() {
        let config = config_with(&["LocalIP", "TrustedIP", "IPrev", "SPF", "DKIM", "DMARC"]);
        let registry = Registry::from_config(&config).unwrap();

        assert!(registry.is_loaded("SPF"));
        assert!(!registry.is_loaded("Size"));

        let connect_chain: Vec<&'static str> = registry
            .get_callbacks(Event::Connect)
            .iter()
            .map(|handler| handler.name())
            .collect();
        assert_eq!(connect_chain, vec!["LocalIP", "TrustedIP", "IPrev"]);
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let config = config_with(&["NoSuchHandler"]);
        assert!(matches!(
            Registry::from_config(&config),
            Err(RegistryError::UnknownHandler(_))
        ));
    }

    #[test]
    fn dependency_must_come_earlier() {
        let config = config_with(&["DMARC", "SPF", "DKIM"]);
        let err = Registry::from_config(&config).unwrap_err();
        assert!(matches!(err, RegistryError::MissingRequirement { .. }));

        let config = config_with(&["SPF", "DKIM", "DMARC"]);
        assert!(Registry::from_config(&config).is_ok());
    }

    #[test]
    fn registry_sorts_same_key_fragments_through_the_handler() {
        use crate::headers::{AuthEntry, HeaderAccumulator};

        let config = config_with(&["DKIM"]);
        let registry = Registry::from_config(&config).unwrap();

        let mut accumulator = HeaderAccumulator::new();
        accumulator.add_auth_header(AuthEntry::new("dkim", "fail").prop("header.d", "b.example"));
        accumulator.add_auth_header(AuthEntry::new("dkim", "pass").prop("header.d", "a.example"));

        let fragments = accumulator.sorted_fragments(&registry);
        assert_eq!(fragments[0].identifier(), Some("a.example"));
        assert_eq!(fragments[1].identifier(), Some("b.example"));
    }

    #[test]
    fn ptr_requires_iprev() {
        let config = config_with(&["PTR"]);
        assert!(matches!(
            Registry::from_config(&config),
            Err(RegistryError::MissingRequirement { .. })
        ));

        let config = config_with(&["IPrev", "PTR"]);
        assert!(Registry::from_config(&config).is_ok());
    }
}
