//! Checks that the return-path domain accepts bounces: an MX record, or at
//! least an address record to fall back on.

use async_trait::async_trait;

use crate::{
    address,
    handlers::{
        dns_budget, with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct ReturnOk;

impl ReturnOk {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReturnOk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for ReturnOk {
    fn name(&self) -> &'static str {
        "ReturnOK"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, from: &str) -> HandlerResult {
        if ctx.skip_auth_checks() {
            return Ok(());
        }

        let domain = address::get_domain_from(from);
        if domain == address::UNKNOWN_DOMAIN {
            // Null reverse-path, nothing to check.
            return Ok(());
        }

        let resolver = ctx.resolver()?;
        let budget = dns_budget(&ctx.config);

        let lookup = with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "returnok lookup",
            async {
                let mx = resolver.mx_lookup(&domain).await;
                if !mx.is_empty() {
                    return (true, false);
                }
                let has_address = !resolver.ipv4_lookup(&domain).await.is_empty()
                    || !resolver.ipv6_lookup(&domain).await.is_empty();
                (false, has_address)
            },
        )
        .await?;

        let entry = match lookup {
            Guarded::Ok((true, _)) => {
                AuthEntry::new("x-return-mx", "pass").prop("smtp.mailfrom", domain)
            }
            Guarded::Ok((false, true)) => AuthEntry::new("x-return-mx", "warn")
                .prop("smtp.mailfrom", domain)
                .comment("no MX record, address record only"),
            Guarded::Ok((false, false)) => AuthEntry::new("x-return-mx", "fail")
                .prop("smtp.mailfrom", domain)
                .comment("domain does not resolve"),
            Guarded::TimedOut => {
                AuthEntry::new("x-return-mx", "temperror").prop("smtp.mailfrom", domain)
            }
        };
        ctx.headers.add_auth_header(entry);

        Ok(())
    }
}
