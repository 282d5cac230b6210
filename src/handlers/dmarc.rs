//! DMARC policy evaluation, consuming the SPF and DKIM verdicts.

use async_trait::async_trait;
use mail_auth::{
    dmarc::{verify::DmarcParameters, Policy},
    AuthenticatedMessage, DmarcOutput, DmarcResult,
};
use serde::Deserialize;

use crate::{
    address,
    handlers::{
        dns_budget, parse_handler_config, registry::RegistryError, spf::SpfState,
        with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct DmarcConfig {
    /// Reject when the published policy is `reject` and evaluation fails.
    hard_reject: bool,
    /// Ignore `quarantine` policies instead of tagging the message.
    no_quarantine: bool,
}

pub struct Dmarc {
    config: DmarcConfig,
}

impl Dmarc {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        Ok(Self {
            config: parse_handler_config("DMARC", section)?,
        })
    }
}

fn result_str(output: &DmarcOutput) -> &'static str {
    match (output.dkim_result(), output.spf_result()) {
        (DmarcResult::Pass, _) | (_, DmarcResult::Pass) => "pass",
        (DmarcResult::TempError(_), _) | (_, DmarcResult::TempError(_)) => "temperror",
        (DmarcResult::None, DmarcResult::None) => "none",
        (DmarcResult::PermError(_), _) | (_, DmarcResult::PermError(_)) => "permerror",
        _ => "fail",
    }
}

fn policy_str(policy: Policy) -> &'static str {
    match policy {
        Policy::Reject => "reject",
        Policy::Quarantine => "quarantine",
        Policy::None => "none",
        Policy::Unspecified => "unspecified",
    }
}

#[async_trait]
impl Handler for Dmarc {
    fn name(&self) -> &'static str {
        "DMARC"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eom]
    }

    fn requires(&self) -> &'static [&'static str] {
        &["SPF", "DKIM"]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        if ctx.skip_auth_checks() {
            return Ok(());
        }

        let Some(spf) = ctx
            .peek_state::<SpfState>("SPF")
            .and_then(|state| state.output.clone())
        else {
            // No SPF evaluation for this message, nothing to combine.
            return Ok(());
        };

        let Some((raw, header_from)) = ctx.message().map(|message| {
            let from_header = message
                .headers_list
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("From"))
                .map(|(_, value)| address::get_domain_from(value))
                .unwrap_or_else(|| address::UNKNOWN_DOMAIN.to_string());
            (message.raw_message(), from_header)
        }) else {
            return Ok(());
        };

        let mail_from_domain = ctx
            .message()
            .and_then(|message| message.env_from.as_deref())
            .map(address::get_domain_from)
            .unwrap_or_else(|| address::UNKNOWN_DOMAIN.to_string());

        let Some(message) = AuthenticatedMessage::parse(&raw) else {
            ctx.headers
                .add_auth_header(AuthEntry::new("dmarc", "permerror"));
            return Ok(());
        };

        let authenticator = ctx.spf_server()?;
        let budget = dns_budget(&ctx.config);

        let output = match with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "dmarc evaluation",
            async {
                let dkim = authenticator.verify_dkim(&message).await;
                authenticator
                    .verify_dmarc(DmarcParameters::new(
                        &message,
                        &dkim,
                        &mail_from_domain,
                        spf.as_ref(),
                    ))
                    .await
            },
        )
        .await?
        {
            Guarded::Ok(output) => output,
            Guarded::TimedOut => {
                ctx.headers.add_auth_header(
                    AuthEntry::new("dmarc", "temperror").prop("header.from", header_from),
                );
                return Ok(());
            }
        };

        let result = result_str(&output);
        let policy = output.policy();
        ctx.headers.add_auth_header(
            AuthEntry::new("dmarc", result)
                .prop("policy.dmarc", policy_str(policy))
                .prop("header.from", header_from.clone()),
        );

        if result == "fail" {
            match policy {
                Policy::Reject if self.config.hard_reject => {
                    ctx.dbg("dmarc", format!("reject policy for {header_from}"));
                    ctx.disposition
                        .reject_mail(format!("550 5.7.1 DMARC fail for {header_from}"));
                }
                Policy::Quarantine if !self.config.no_quarantine => {
                    ctx.dbg("dmarc", format!("quarantine policy for {header_from}"));
                    ctx.disposition
                        .quarantine_mail(format!("DMARC quarantine policy for {header_from}"));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
