//! SPF policy evaluation for the HELO and MAIL FROM identities.

use std::sync::Arc;

use async_trait::async_trait;
use mail_auth::{spf::verify::SpfParameters, SpfOutput, SpfResult};
use serde::Deserialize;

use crate::{
    address,
    handlers::{
        dns_budget, parse_handler_config, registry::RegistryError, spf_result_str,
        with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct SpfConfig {
    /// Reject outright on an SPF hard fail.
    hard_reject: bool,
}

/// SPF evaluation shared with later handlers (DMARC).
#[derive(Default)]
pub struct SpfState {
    pub output: Option<Arc<SpfOutput>>,
    pub mail_from: String,
}

pub struct Spf {
    config: SpfConfig,
}

impl Spf {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        Ok(Self {
            config: parse_handler_config("SPF", section)?,
        })
    }
}

#[async_trait]
impl Handler for Spf {
    fn name(&self) -> &'static str {
        "SPF"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, from: &str) -> HandlerResult {
        if ctx.skip_auth_checks() {
            return Ok(());
        }
        let Some(ip) = ctx.ip() else {
            return Ok(());
        };

        let sender = address::parse_addresses(from)
            .into_iter()
            .next()
            .unwrap_or_default();
        let helo = ctx.helo_name().unwrap_or("unknown").to_string();
        let hostname = ctx.config.hostname.clone();

        let authenticator = ctx.spf_server()?;
        let budget = dns_budget(&ctx.config);

        let output = with_handler_deadline(&mut ctx.deadlines, budget, "spf evaluation", async {
            if sender.is_empty() {
                // Null reverse-path: evaluate the HELO identity instead.
                authenticator
                    .verify_spf(SpfParameters::verify_ehlo(ip, &helo, &hostname))
                    .await
            } else {
                authenticator
                    .verify_spf(SpfParameters::verify_mail_from(ip, &helo, &hostname, &sender))
                    .await
            }
        })
        .await?;

        let entry = match &output {
            Guarded::Ok(output) => {
                AuthEntry::new("spf", spf_result_str(output.result())).prop(
                    "smtp.mailfrom",
                    if sender.is_empty() { helo.clone() } else { sender.clone() },
                )
            }
            Guarded::TimedOut => AuthEntry::new("spf", "temperror").prop(
                "smtp.mailfrom",
                if sender.is_empty() { helo.clone() } else { sender.clone() },
            ),
        };
        ctx.headers.add_auth_header(entry);

        if let Guarded::Ok(output) = output {
            if self.config.hard_reject && output.result() == SpfResult::Fail {
                ctx.dbg("spf", format!("hard fail for {sender}"));
                ctx.disposition
                    .reject_mail(format!("550 5.7.1 SPF fail for {sender}"));
            }

            let state = ctx.handler_state::<SpfState>("SPF");
            state.output = Some(Arc::new(output));
            state.mail_from = sender;
        }

        Ok(())
    }
}
