//! Records the inbound TLS session parameters supplied by the MTA.

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct Tls;

impl Tls {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Tls {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Tls {
    fn name(&self) -> &'static str {
        "TLS"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> HandlerResult {
        let version = ctx
            .symbols
            .get("{tls_version}")
            .or_else(|| ctx.symbols.get("tls_version"))
            .map(str::to_string);

        let Some(version) = version else {
            return Ok(());
        };

        let mut entry = AuthEntry::new("x-tls", "pass").prop("version", version);
        if let Some(cipher) = ctx
            .symbols
            .get("{cipher}")
            .or_else(|| ctx.symbols.get("cipher"))
        {
            entry = entry.prop("cipher", cipher.to_string());
        }
        if let Some(bits) = ctx
            .symbols
            .get("{cipher_bits}")
            .or_else(|| ctx.symbols.get("cipher_bits"))
        {
            entry = entry.prop("bits", bits.to_string());
        }

        ctx.headers.add_c_auth_header(entry);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{config::Config, headers::LexicalSorter, pipeline::ConnectionContext};

    #[tokio::test]
    async fn tls_session_fragment() {
        let mut ctx = ConnectionContext::new(Arc::new(Config::default()));
        ctx.symbols.set('M', "{tls_version}", "TLSv1.3");
        ctx.symbols.set('M', "{cipher}", "TLS_AES_256_GCM_SHA384");
        ctx.symbols.set('M', "{cipher_bits}", "256");

        Tls::new().envfrom(&mut ctx, "<alice@example.com>").await.unwrap();

        let fragments = ctx.headers.sorted_fragments(&LexicalSorter);
        assert_eq!(fragments.len(), 1);
        assert_eq!(
            fragments[0].as_string(),
            "x-tls=pass version=TLSv1.3 cipher=TLS_AES_256_GCM_SHA384 bits=256"
        );
    }

    #[tokio::test]
    async fn plaintext_session_stays_quiet() {
        let mut ctx = ConnectionContext::new(Arc::new(Config::default()));

        Tls::new().envfrom(&mut ctx, "<alice@example.com>").await.unwrap();

        assert!(ctx.headers.sorted_fragments(&LexicalSorter).is_empty());
    }
}
