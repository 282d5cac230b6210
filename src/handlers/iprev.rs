//! Forward-confirmed reverse DNS (iprev, RFC 8601 §2.7.3).
//!
//! PTR-resolves the connecting address, then forward-resolves each returned
//! name and checks that one of the answers matches the original address.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    handlers::{
        dns_budget, parse_handler_config, registry::RegistryError, with_handler_deadline, Event,
        Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct IpRevConfig {
    disabled: bool,
}

pub struct IpRev {
    config: IpRevConfig,
}

impl IpRev {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        Ok(Self {
            config: parse_handler_config("IPrev", section)?,
        })
    }
}

fn fragment(result: &str, ip: IpAddr, domain: &str) -> AuthEntry {
    AuthEntry::new("iprev", result)
        .prop("policy.iprev", ip.to_string())
        .comment(domain.to_string())
}

#[async_trait]
impl Handler for IpRev {
    fn name(&self) -> &'static str {
        "IPrev"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Connect]
    }

    async fn connect(&self, ctx: &mut ConnectionContext, _hostname: &str) -> HandlerResult {
        if self.config.disabled || ctx.skip_auth_checks() {
            return Ok(());
        }
        let Some(ip) = ctx.ip() else {
            return Ok(());
        };

        let resolver = ctx.resolver()?;
        let budget = dns_budget(&ctx.config);

        let names = match with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "iprev ptr lookup",
            resolver.ptr_lookup(ip),
        )
        .await?
        {
            Guarded::Ok(names) => names,
            Guarded::TimedOut => {
                ctx.headers
                    .add_c_auth_header(fragment("temperror", ip, "NOT FOUND"));
                return Ok(());
            }
        };

        if names.is_empty() {
            ctx.headers.add_c_auth_header(fragment("fail", ip, "NOT FOUND"));
            return Ok(());
        }

        for name in &names {
            let forward = with_handler_deadline(
                &mut ctx.deadlines,
                budget,
                "iprev forward lookup",
                async {
                    let mut addresses: Vec<IpAddr> = resolver
                        .ipv4_lookup(name)
                        .await
                        .into_iter()
                        .map(IpAddr::from)
                        .collect();
                    if addresses.is_empty() {
                        addresses = resolver
                            .ipv6_lookup(name)
                            .await
                            .into_iter()
                            .map(IpAddr::from)
                            .collect();
                    }
                    addresses
                },
            )
            .await?;

            let addresses = match forward {
                Guarded::Ok(addresses) => addresses,
                Guarded::TimedOut => {
                    ctx.headers
                        .add_c_auth_header(fragment("temperror", ip, name));
                    return Ok(());
                }
            };

            if addresses.contains(&ip) {
                ctx.dbg("iprev", format!("verified ptr {name}"));
                ctx.set_verified_ptr(name.clone());
                ctx.headers.add_c_auth_header(fragment("pass", ip, name));
                return Ok(());
            }
        }

        // None of the PTR names resolved back to the peer address.
        ctx.headers
            .add_c_auth_header(fragment("fail", ip, &names[0]));
        Ok(())
    }
}
