//! DKIM signature verification over the captured message.

use std::cmp::Ordering;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use mail_auth::AuthenticatedMessage;
use serde::Deserialize;

use crate::{
    handlers::{
        dkim_result_str, dns_budget, parse_handler_config, registry::RegistryError,
        with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::{AuthEntry, AuthFragment},
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct DkimConfig {
    /// Reject signed mail when no signature verifies.
    hard_reject: bool,
}

/// Verification outcome shared with later handlers (AlignedFrom).
#[derive(Default)]
pub struct DkimState {
    /// `(signing domain, result)` per signature.
    pub results: Vec<(String, &'static str)>,
}

pub struct Dkim {
    config: DkimConfig,
}

impl Dkim {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        Ok(Self {
            config: parse_handler_config("DKIM", section)?,
        })
    }
}

#[async_trait]
impl Handler for Dkim {
    fn name(&self) -> &'static str {
        "DKIM"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eom]
    }

    fn can_sort_header(&self, name: &str) -> bool {
        name == "dkim"
    }

    /// Multiple signatures sort by signing domain, then by the full text.
    fn handler_header_sort(&self, a: &AuthFragment, b: &AuthFragment) -> Ordering {
        a.identifier()
            .unwrap_or_default()
            .cmp(b.identifier().unwrap_or_default())
            .then_with(|| a.as_string().cmp(&b.as_string()))
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        let Some(raw) = ctx.message().map(|message| message.raw_message()) else {
            return Ok(());
        };

        let signed = ctx
            .message()
            .is_some_and(|message| {
                message
                    .headers_list
                    .iter()
                    .any(|(name, _)| name.eq_ignore_ascii_case("DKIM-Signature"))
            });
        if !signed {
            ctx.headers.add_auth_header(AuthEntry::new("dkim", "none"));
            return Ok(());
        }

        let Some(message) = AuthenticatedMessage::parse(&raw) else {
            ctx.headers.add_auth_header(AuthEntry::new("dkim", "permerror"));
            return Ok(());
        };

        let authenticator = ctx.spf_server()?;
        let budget = dns_budget(&ctx.config);

        let outputs = match with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "dkim verification",
            authenticator.verify_dkim(&message),
        )
        .await?
        {
            Guarded::Ok(outputs) => outputs,
            Guarded::TimedOut => {
                ctx.headers.add_auth_header(AuthEntry::new("dkim", "temperror"));
                return Ok(());
            }
        };

        let mut results: Vec<(String, &'static str)> = Vec::new();
        let mut entries = Vec::new();
        for output in &outputs {
            let result = dkim_result_str(output.result());
            let mut entry = AuthEntry::new("dkim", result);
            if let Some(signature) = output.signature() {
                let b8: String = Base64::encode_string(&signature.b).chars().take(8).collect();
                entry = entry
                    .prop("header.d", signature.d.to_string())
                    .prop("header.s", signature.s.to_string())
                    .prop("header.b", b8);
                results.push((signature.d.to_string(), result));
            }
            entries.push(entry);
        }
        for entry in entries {
            ctx.headers.add_auth_header(entry);
        }

        let any_pass = results.iter().any(|(_, result)| *result == "pass");
        if self.config.hard_reject && !any_pass && !ctx.skip_auth_checks() {
            ctx.disposition
                .reject_mail("550 5.7.20 No passing DKIM signature found");
        }

        ctx.handler_state::<DkimState>("DKIM").results = results;
        Ok(())
    }
}
