//! Message size accounting and an optional hard limit.

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    handlers::{parse_handler_config, registry::RegistryError, Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct SizeConfig {
    /// Maximum message size in bytes; 0 means unlimited.
    max_size: u64,
}

#[derive(Default)]
struct SizeState {
    bytes: u64,
}

pub struct Size {
    config: SizeConfig,
}

impl Size {
    pub fn from_config(section: &serde_json::Value) -> Result<Self, RegistryError> {
        Ok(Self {
            config: parse_handler_config("Size", section)?,
        })
    }
}

#[async_trait]
impl Handler for Size {
    fn name(&self) -> &'static str {
        "Size"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::EnvFrom, Event::Header, Event::Body, Event::Eom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> HandlerResult {
        ctx.handler_state::<SizeState>("Size").bytes = 0;
        Ok(())
    }

    async fn header(&self, ctx: &mut ConnectionContext, name: &str, value: &str) -> HandlerResult {
        // name, colon, space, value, CRLF
        ctx.handler_state::<SizeState>("Size").bytes += (name.len() + value.len() + 4) as u64;
        Ok(())
    }

    async fn body(&self, ctx: &mut ConnectionContext, chunk: &[u8]) -> HandlerResult {
        ctx.handler_state::<SizeState>("Size").bytes += chunk.len() as u64;
        Ok(())
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        let bytes = ctx.handler_state::<SizeState>("Size").bytes;

        let exceeded = self.config.max_size > 0 && bytes > self.config.max_size;
        let result = if exceeded { "fail" } else { "ok" };
        ctx.headers
            .add_auth_header(AuthEntry::new("x-size", result).prop("size.bytes", bytes.to_string()));

        if exceeded {
            ctx.headers.add_auth_header(
                AuthEntry::new("x-size", "fail")
                    .prop("size.exceeded", self.config.max_size.to_string()),
            );
            ctx.dbg("size", format!("{bytes} bytes exceeds {}", self.config.max_size));
            ctx.disposition.reject_mail(format!(
                "552 5.3.4 Message size exceeds limit of {} bytes",
                self.config.max_size
            ));
        }

        Ok(())
    }
}
