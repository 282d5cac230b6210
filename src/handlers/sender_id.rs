//! Legacy Sender ID (RFC 4406): SPF evaluated against the purported
//! responsible address from the message header.

use async_trait::async_trait;
use mail_auth::spf::verify::SpfParameters;

use crate::{
    address,
    handlers::{
        dns_budget, spf_result_str, with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct SenderId;

impl SenderId {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SenderId {
    fn default() -> Self {
        Self::new()
    }
}

/// The PRA is the Sender header when present, the From header otherwise.
fn pra_address(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Sender"))
        .or_else(|| {
            headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("From"))
        })
        .map(|(_, value)| {
            address::parse_addresses(value)
                .into_iter()
                .next()
                .unwrap_or_default()
        })
        .filter(|address| !address.is_empty())
}

#[async_trait]
impl Handler for SenderId {
    fn name(&self) -> &'static str {
        "SenderID"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eoh]
    }

    async fn eoh(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        if ctx.skip_auth_checks() {
            return Ok(());
        }
        let Some(ip) = ctx.ip() else {
            return Ok(());
        };

        let Some(pra) = ctx.message().and_then(|message| pra_address(&message.headers_list))
        else {
            return Ok(());
        };

        let helo = ctx.helo_name().unwrap_or("unknown").to_string();
        let hostname = ctx.config.hostname.clone();
        let authenticator = ctx.spf_server()?;
        let budget = dns_budget(&ctx.config);

        let output = with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "senderid evaluation",
            authenticator.verify_spf(SpfParameters::verify_mail_from(ip, &helo, &hostname, &pra)),
        )
        .await?;

        let domain = address::get_domain_from(&pra);
        let entry = match output {
            Guarded::Ok(output) => {
                AuthEntry::new("senderid", spf_result_str(output.result())).prop("header.from", domain)
            }
            Guarded::TimedOut => AuthEntry::new("senderid", "temperror").prop("header.from", domain),
        };
        ctx.headers.add_auth_header(entry);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sender_header_wins_over_from() {
        let headers = vec![
            ("From".to_string(), "Alice <alice@example.com>".to_string()),
            ("Sender".to_string(), "List <list@example.net>".to_string()),
        ];
        assert_eq!(pra_address(&headers), Some("list@example.net".to_string()));

        let headers = vec![("From".to_string(), "alice@example.com".to_string())];
        assert_eq!(pra_address(&headers), Some("alice@example.com".to_string()));

        assert_eq!(pra_address(&[]), None);
    }
}
