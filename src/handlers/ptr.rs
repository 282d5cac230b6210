//! Compares the HELO name against the PTR name verified by IPrev.

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct Ptr;

impl Ptr {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Ptr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Ptr {
    fn name(&self) -> &'static str {
        "PTR"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Helo]
    }

    fn requires(&self) -> &'static [&'static str] {
        &["IPrev"]
    }

    async fn helo(&self, ctx: &mut ConnectionContext, helo_host: &str) -> HandlerResult {
        if ctx.skip_auth_checks() {
            return Ok(());
        }

        let Some(verified) = ctx.verified_ptr().map(str::to_string) else {
            // Without a verified PTR there is nothing to compare against.
            return Ok(());
        };

        let result = if verified.eq_ignore_ascii_case(helo_host) {
            "pass"
        } else {
            "fail"
        };

        ctx.headers.add_c_auth_header(
            AuthEntry::new("x-ptr", result)
                .prop("x-ptr-helo", helo_host.to_string())
                .prop("x-ptr-lookup", verified),
        );
        Ok(())
    }
}
