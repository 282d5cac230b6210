//! Verification of `X-Google-DKIM-Signature` headers.
//!
//! The signature format is ordinary DKIM under a different header name, so
//! the captured message is re-written with the standard name before it is
//! handed to the verifier.

use async_trait::async_trait;
use mail_auth::AuthenticatedMessage;

use crate::{
    handlers::{
        dkim_result_str, dns_budget, with_handler_deadline, Event, Guarded, Handler, HandlerResult,
    },
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

const GOOGLE_HEADER: &str = "X-Google-DKIM-Signature";

pub struct XGoogleDkim;

impl XGoogleDkim {
    pub fn new() -> Self {
        Self
    }
}

impl Default for XGoogleDkim {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for XGoogleDkim {
    fn name(&self) -> &'static str {
        "XGoogleDKIM"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        let Some(raw) = ctx.message().and_then(|message| {
            let signed = message
                .headers_list
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case(GOOGLE_HEADER));
            if !signed {
                return None;
            }

            // Rebuild the message with the standard header name; regular
            // DKIM-Signature headers are dropped so they cannot interfere.
            let mut rebuilt = Vec::with_capacity(message.body.len() + 512);
            for (name, value) in &message.headers_list {
                if name.eq_ignore_ascii_case("DKIM-Signature") {
                    continue;
                }
                let name = if name.eq_ignore_ascii_case(GOOGLE_HEADER) {
                    "DKIM-Signature"
                } else {
                    name.as_str()
                };
                rebuilt.extend_from_slice(name.as_bytes());
                rebuilt.extend_from_slice(b": ");
                rebuilt.extend_from_slice(value.as_bytes());
                rebuilt.extend_from_slice(b"\r\n");
            }
            rebuilt.extend_from_slice(b"\r\n");
            rebuilt.extend_from_slice(&message.body);
            Some(rebuilt)
        }) else {
            return Ok(());
        };

        let Some(message) = AuthenticatedMessage::parse(&raw) else {
            ctx.headers
                .add_auth_header(AuthEntry::new("x-google-dkim", "permerror"));
            return Ok(());
        };

        let authenticator = ctx.spf_server()?;
        let budget = dns_budget(&ctx.config);

        let outputs = match with_handler_deadline(
            &mut ctx.deadlines,
            budget,
            "x-google-dkim verification",
            authenticator.verify_dkim(&message),
        )
        .await?
        {
            Guarded::Ok(outputs) => outputs,
            Guarded::TimedOut => {
                ctx.headers
                    .add_auth_header(AuthEntry::new("x-google-dkim", "temperror"));
                return Ok(());
            }
        };

        let mut entries = Vec::new();
        for output in &outputs {
            let mut entry = AuthEntry::new("x-google-dkim", dkim_result_str(output.result()));
            if let Some(signature) = output.signature() {
                entry = entry
                    .prop("header.d", signature.d.to_string())
                    .prop("header.s", signature.s.to_string());
            }
            entries.push(entry);
        }
        for entry in entries {
            ctx.headers.add_auth_header(entry);
        }

        Ok(())
    }
}
