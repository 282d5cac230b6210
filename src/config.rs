//! Gateway configuration, loaded from a JSON file.
//!
//! Every key is optional and falls back to a working default, matching how
//! deployments usually configure only the handler list and a few timeouts.

use std::{collections::BTreeMap, net::IpAddr, path::Path, sync::Arc, time::Duration};

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::timeout::TimeoutClass;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Read(std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A hook that may rewrite a handler's configuration each time it is read.
/// The mutation happens on a clone; the loaded configuration is never
/// altered in place.
pub trait CallbackProcessor: Send + Sync {
    fn handler_config(&self, handler_type: &str, config: &mut serde_json::Value);
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Seconds per DNS query, UDP and TCP alike.
    pub dns_timeout: u64,
    pub dns_retry: usize,
    /// Nameserver addresses, `ip` or `ip:port`. Empty means the library
    /// defaults.
    pub dns_resolvers: Vec<String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            dns_timeout: 8,
            dns_retry: 2,
            dns_resolvers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpMapEntry {
    pub ip: Option<IpAddr>,
    pub helo: Option<String>,
}

/// Indentation and folding choices for the serialized
/// `Authentication-Results` header.
#[derive(Debug, Clone)]
pub struct HeaderFormat {
    pub indent_style: String,
    pub indent_by: usize,
    pub fold_at: usize,
}

impl Default for HeaderFormat {
    fn default() -> Self {
        Self {
            indent_style: "entry".to_string(),
            indent_by: 4,
            fold_at: 800,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The authserv-id placed on emitted `Authentication-Results` headers.
    pub hostname: String,

    pub debug: bool,
    /// Also write log output to stderr.
    pub logtoerr: bool,
    /// Run every check but suppress header mutation packets.
    pub dryrun: bool,

    /// Section budgets in seconds; 0 disarms the budget.
    pub connect_timeout: u64,
    pub command_timeout: u64,
    pub content_timeout: u64,
    pub addheader_timeout: u64,
    /// Whole-session budget armed when the connection is accepted.
    pub overall_timeout: u64,

    #[serde(flatten)]
    pub dns: DnsConfig,

    /// Prefix (or bare address) to connection rewrite rules. Keys are
    /// matched in sorted order; the first overlapping prefix wins.
    pub ip_map: BTreeMap<String, IpMapEntry>,

    /// Additional authserv-ids whose `Authentication-Results` headers are
    /// stripped from inbound mail.
    pub hosts_to_remove: Vec<String>,

    pub header_indent_style: String,
    pub header_indent_by: usize,
    pub header_fold_at: usize,

    pub tempfail_on_error: bool,
    pub tempfail_on_error_authenticated: bool,
    pub tempfail_on_error_local: bool,
    pub tempfail_on_error_trusted: bool,

    /// Handlers in dispatch order.
    pub load_handlers: Vec<String>,
    /// Handler-specific configuration, keyed by handler name.
    pub handlers: BTreeMap<String, serde_json::Value>,

    /// Milter listener, `host:port`.
    pub milter_listen: Option<String>,
    /// SMTP proxy listener, `host:port`.
    pub smtp_listen: Option<String>,
    /// Downstream SMTP server the proxy relays accepted mail to.
    pub smtp_downstream: Option<String>,

    #[serde(skip)]
    callback_processor: Option<Arc<dyn CallbackProcessor>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME")
                .unwrap_or_else(|_| "localhost.localdomain".to_string()),
            debug: false,
            logtoerr: false,
            dryrun: false,
            connect_timeout: 30,
            command_timeout: 30,
            content_timeout: 60,
            addheader_timeout: 30,
            overall_timeout: 600,
            dns: DnsConfig::default(),
            ip_map: BTreeMap::new(),
            hosts_to_remove: Vec::new(),
            header_indent_style: "entry".to_string(),
            header_indent_by: 4,
            header_fold_at: 800,
            tempfail_on_error: true,
            tempfail_on_error_authenticated: true,
            tempfail_on_error_local: true,
            tempfail_on_error_trusted: true,
            load_handlers: Vec::new(),
            handlers: BTreeMap::new(),
            milter_listen: None,
            smtp_listen: None,
            smtp_downstream: None,
            callback_processor: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn set_callback_processor(&mut self, processor: Arc<dyn CallbackProcessor>) {
        self.callback_processor = Some(processor);
    }

    /// The section budget for one callback class. Zero means unlimited.
    pub fn get_type_timeout(&self, class: TimeoutClass) -> Duration {
        let seconds = match class {
            TimeoutClass::Connect => self.connect_timeout,
            TimeoutClass::Command => self.command_timeout,
            TimeoutClass::Content => self.content_timeout,
            TimeoutClass::AddHeader => self.addheader_timeout,
        };
        Duration::from_secs(seconds)
    }

    pub fn header_format(&self) -> HeaderFormat {
        HeaderFormat {
            indent_style: self.header_indent_style.clone(),
            indent_by: self.header_indent_by,
            fold_at: self.header_fold_at,
        }
    }

    /// A handler's configuration section, cloned and run through the
    /// callback processor when one is installed.
    pub fn handler_config(&self, name: &str) -> serde_json::Value {
        let mut value = self
            .handlers
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if let Some(processor) = &self.callback_processor {
            processor.handler_config(name, &mut value);
        }
        value
    }

    /// The first `ip_map` entry (lowest key in sorted order) whose prefix
    /// overlaps the peer address.
    pub fn remap_for(&self, ip: IpAddr) -> Option<&IpMapEntry> {
        self.ip_map.iter().find_map(|(prefix, entry)| {
            let net = prefix
                .parse::<IpNet>()
                .or_else(|_| prefix.parse::<IpAddr>().map(IpNet::from));
            match net {
                Ok(net) if net.contains(&ip) => Some(entry),
                Ok(_) => None,
                Err(_) => {
                    warn!("ignoring unparseable ip_map prefix {prefix:?}");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.dns.dns_timeout, 8);
        assert_eq!(config.dns.dns_retry, 2);
        assert_eq!(config.header_indent_by, 4);
        assert!(config.tempfail_on_error);
    }

    #[test]
    fn parses_recognized_keys() {
        let config: Config = serde_json::from_str(
            r#"{
                "hostname": "mx.example.com",
                "debug": true,
                "dryrun": true,
                "connect_timeout": 2,
                "dns_timeout": 3,
                "dns_resolvers": ["192.0.2.53"],
                "ip_map": {
                    "198.51.100.0/24": {"ip": "192.0.2.5", "helo": "masked.example"}
                },
                "hosts_to_remove": ["old.example.com"],
                "tempfail_on_error": false,
                "load_handlers": ["LocalIP", "SPF"],
                "handlers": {"SPF": {"hard_reject": true}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.hostname, "mx.example.com");
        assert_eq!(config.dns.dns_timeout, 3);
        assert_eq!(
            config.get_type_timeout(TimeoutClass::Connect),
            Duration::from_secs(2)
        );
        assert_eq!(config.load_handlers, vec!["LocalIP", "SPF"]);
        assert_eq!(
            config.handler_config("SPF"),
            serde_json::json!({"hard_reject": true})
        );
        assert_eq!(config.handler_config("DKIM"), serde_json::Value::Null);
    }

    #[test]
    fn ip_map_lowest_key_wins() {
        let config: Config = serde_json::from_str(
            r#"{
                "ip_map": {
                    "198.51.100.0/24": {"ip": "192.0.2.1"},
                    "198.51.100.0/25": {"ip": "192.0.2.2"}
                }
            }"#,
        )
        .unwrap();

        // Both prefixes overlap; "198.51.100.0/24" sorts first.
        let entry = config.remap_for("198.51.100.77".parse().unwrap()).unwrap();
        assert_eq!(entry.ip, Some("192.0.2.1".parse().unwrap()));

        assert!(config.remap_for("203.0.113.1".parse().unwrap()).is_none());
    }

    #[test]
    fn callback_processor_mutates_a_clone() {
        struct ForceDisable;
        impl CallbackProcessor for ForceDisable {
            fn handler_config(&self, handler_type: &str, config: &mut serde_json::Value) {
                if handler_type == "SPF" {
                    config["disabled"] = serde_json::json!(true);
                }
            }
        }

        let mut config = Config::default();
        config
            .handlers
            .insert("SPF".to_string(), serde_json::json!({}));
        config.set_callback_processor(Arc::new(ForceDisable));

        assert_eq!(
            config.handler_config("SPF"),
            serde_json::json!({"disabled": true})
        );
        // the stored section is untouched
        assert_eq!(config.handlers["SPF"], serde_json::json!({}));
    }
}
