//! DMARC-style alignment between the RFC 5322 From domain, the envelope
//! sender and the DKIM signing domains.

use async_trait::async_trait;

use crate::{
    address,
    handlers::{dkim::DkimState, Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct AlignedFrom;

impl AlignedFrom {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AlignedFrom {
    fn default() -> Self {
        Self::new()
    }
}

/// The registrable domain approximated as the last two labels.
fn org_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.rsplit('.').take(2).collect();
    labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

#[async_trait]
impl Handler for AlignedFrom {
    fn name(&self) -> &'static str {
        "AlignedFrom"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        let Some(message) = ctx.message() else {
            return Ok(());
        };

        let header_domain = message
            .headers_list
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("From"))
            .map(|(_, value)| address::get_domain_from(value))
            .unwrap_or_else(|| address::UNKNOWN_DOMAIN.to_string());
        let env_domain = message
            .env_from
            .as_deref()
            .map(address::get_domain_from)
            .unwrap_or_else(|| address::UNKNOWN_DOMAIN.to_string());

        let dkim_domains: Vec<String> = ctx
            .peek_state::<DkimState>("DKIM")
            .map(|state| {
                state
                    .results
                    .iter()
                    .filter(|(_, result)| *result == "pass")
                    .map(|(domain, _)| domain.clone())
                    .collect()
            })
            .unwrap_or_default();

        let result = if header_domain.eq_ignore_ascii_case(&env_domain) {
            "pass"
        } else if dkim_domains
            .iter()
            .any(|domain| domain.eq_ignore_ascii_case(&header_domain))
        {
            "domain_pass"
        } else if org_domain(&header_domain).eq_ignore_ascii_case(&org_domain(&env_domain))
            || dkim_domains
                .iter()
                .any(|domain| org_domain(domain).eq_ignore_ascii_case(&org_domain(&header_domain)))
        {
            "orgdomain_pass"
        } else {
            "fail"
        };

        ctx.headers.add_auth_header(
            AuthEntry::new("x-aligned-from", result)
                .prop("header.from", header_domain)
                .prop("smtp.mailfrom", env_domain),
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn org_domain_is_last_two_labels() {
        assert_eq!(org_domain("mail.example.com"), "example.com");
        assert_eq!(org_domain("example.com"), "example.com");
        assert_eq!(org_domain("localhost"), "localhost");
    }
}
