//! DNS lookups for the authentication handlers.
//!
//! Wraps a hickory resolver built from the `dns_resolvers` / `dns_timeout` /
//! `dns_retry` configuration. Tests swap in a table-driven mock so pipeline
//! behavior is deterministic.

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
};
#[cfg(not(test))]
use std::net::SocketAddr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
#[cfg(not(test))]
use tracing::warn;
use tracing::trace;

use crate::config::DnsConfig;

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new(config: &DnsConfig) -> Self {
        let mut resolver_options = ResolverOpts::default();
        resolver_options.timeout = std::time::Duration::from_secs(config.dns_timeout);
        resolver_options.attempts = config.dns_retry;

        let resolver_config = if config.dns_resolvers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for nameserver in &config.dns_resolvers {
                let socket_addr: SocketAddr = match nameserver.parse() {
                    Ok(addr) => addr,
                    Err(_) => match nameserver.parse::<IpAddr>() {
                        Ok(ip) => SocketAddr::new(ip, 53),
                        Err(_) => {
                            warn!("ignoring unparseable nameserver {nameserver:?}");
                            continue;
                        }
                    },
                };
                resolver_config.add_name_server(NameServerConfig {
                    socket_addr,
                    protocol: Protocol::Udp,
                    tls_dns_name: None,
                    http_endpoint: None,
                    trust_negative_responses: false,
                    bind_addr: None,
                });
            }
            resolver_config
        };

        Self {
            resolver: Resolver::builder_with_config(
                resolver_config,
                TokioConnectionProvider::default(),
            )
            .with_options(resolver_options)
            .build(),
        }
    }

    #[cfg(test)]
    pub fn new(_config: &DnsConfig) -> Self {
        Self {
            resolver: mock::Resolver::default(),
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver) -> Self {
        Self { resolver }
    }

    /// Reverse lookup; returns the PTR names without their trailing dot.
    /// A name error (NXDOMAIN) is reported as an empty list, as is any
    /// resolution failure; slow servers are cut off by the caller's deadline.
    pub async fn ptr_lookup(&self, ip: IpAddr) -> Vec<String> {
        trace!("PTR lookup for {ip}");
        self
            .resolver
            .reverse_lookup(ip)
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn ipv4_lookup(&self, name: &str) -> Vec<Ipv4Addr> {
        let name = fqdn(name);
        trace!("A lookup for {name}");
        self
            .resolver
            .ipv4_lookup(name.as_str())
            .await
            .map(|lookup| lookup.iter().map(|a| a.0).collect())
            .unwrap_or_default()
    }

    pub async fn ipv6_lookup(&self, name: &str) -> Vec<Ipv6Addr> {
        let name = fqdn(name);
        trace!("AAAA lookup for {name}");
        self
            .resolver
            .ipv6_lookup(name.as_str())
            .await
            .map(|lookup| lookup.iter().map(|aaaa| aaaa.0).collect())
            .unwrap_or_default()
    }

    pub async fn txt_lookup(&self, name: &str) -> Vec<String> {
        let name = fqdn(name);
        trace!("TXT lookup for {name}");
        self
            .resolver
            .txt_lookup(name.as_str())
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|record| {
                        String::from_utf8_lossy(
                            &record.txt_data().iter().flatten().copied().collect::<Vec<_>>(),
                        )
                        .into_owned()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// MX exchanges ordered by preference, without their trailing dot.
    pub async fn mx_lookup(&self, name: &str) -> Vec<String> {
        let name = fqdn(name);
        trace!("MX lookup for {name}");
        let mut records: Vec<(u16, String)> = self
            .resolver
            .mx_lookup(name.as_str())
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|mx| {
                        (
                            mx.preference(),
                            mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|(preference, _)| *preference);
        records.into_iter().map(|(_, exchange)| exchange).collect()
    }
}

// "hint queries that end with a '.' are fully qualified names and are cheaper
// lookups" per the hickory documentation.
fn fqdn(name: &str) -> String {
    format!("{name}{}", if name.ends_with('.') { "" } else { "." })
}


#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn mock_tables_answer_lookups() {
        let mut tables = mock::Resolver::default();
        tables.ptr.insert(
            "192.0.2.10".parse().unwrap(),
            vec!["mail.example.com".to_string()],
        );
        tables
            .a
            .insert("mail.example.com".to_string(), vec!["192.0.2.10".parse().unwrap()]);
        let resolver = DnsResolver::mock(tables);

        let names = resolver.ptr_lookup("192.0.2.10".parse().unwrap()).await;
        assert_eq!(names, vec!["mail.example.com"]);

        let addresses = resolver.ipv4_lookup("mail.example.com").await;
        assert_eq!(addresses, vec!["192.0.2.10".parse::<Ipv4Addr>().unwrap()]);

        let missing = resolver.ipv4_lookup("other.example.com").await;
        assert!(missing.is_empty());
    }
}
