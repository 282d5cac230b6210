//! Classifies connections from operator-trusted networks.

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;

use crate::{
    handlers::{parse_handler_config, registry::RegistryError, Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct TrustedIpConfig {
    trusted_ip_list: Vec<String>,
}

pub struct TrustedIp {
    networks: Vec<IpNet>,
}

impl TrustedIp {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        let config: TrustedIpConfig = parse_handler_config("TrustedIP", section)?;

        let mut networks = Vec::with_capacity(config.trusted_ip_list.len());
        for entry in &config.trusted_ip_list {
            let net = entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| RegistryError::HandlerConfig {
                    handler: "TrustedIP".to_string(),
                    message: format!("unparseable trusted_ip_list entry {entry:?}"),
                })?;
            networks.push(net);
        }

        Ok(Self { networks })
    }
}

#[async_trait]
impl Handler for TrustedIp {
    fn name(&self) -> &'static str {
        "TrustedIP"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Connect]
    }

    async fn connect(&self, ctx: &mut ConnectionContext, _hostname: &str) -> HandlerResult {
        let Some(ip) = ctx.ip() else {
            return Ok(());
        };

        if self.networks.iter().any(|net| net.contains(&ip)) {
            ctx.dbg("trusted-ip", ip.to_string());
            ctx.set_trusted();
            ctx.headers.add_c_auth_header(
                AuthEntry::new("x-trusted-ip", "pass").prop("policy.trusted", ip.to_string()),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_prefixes_and_bare_addresses() {
        let handler = TrustedIp::from_config(&serde_json::json!({
            "trusted_ip_list": ["203.0.113.0/24", "192.0.2.7"]
        }))
        .unwrap();
        assert_eq!(handler.networks.len(), 2);
        assert!(handler.networks[0].contains(&"203.0.113.50".parse::<std::net::IpAddr>().unwrap()));

        let err = TrustedIp::from_config(&serde_json::json!({
            "trusted_ip_list": ["not-an-ip"]
        }));
        assert!(err.is_err());
    }
}
