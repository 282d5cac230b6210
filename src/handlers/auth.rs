//! Marks SMTP-authenticated senders, from the MTA's `{auth_authen}` macro.

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct Auth;

impl Auth {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Auth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Auth {
    fn name(&self) -> &'static str {
        "Auth"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> HandlerResult {
        let user = ctx
            .symbols
            .get("{auth_authen}")
            .or_else(|| ctx.symbols.get("auth_authen"))
            .map(str::to_string);

        if let Some(user) = user {
            ctx.dbg("auth", user.clone());
            ctx.set_authenticated();
            ctx.headers.add_auth_header(
                AuthEntry::new("auth", "pass").comment(format!("authenticated as {user}")),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{config::Config, headers::LexicalSorter, pipeline::ConnectionContext};

    #[tokio::test]
    async fn authenticated_sender_fragment() {
        let mut ctx = ConnectionContext::new(Arc::new(Config::default()));
        ctx.symbols.set('M', "{auth_authen}", "alice");

        Auth::new().envfrom(&mut ctx, "<alice@example.com>").await.unwrap();

        assert!(ctx.is_authenticated());
        let fragments = ctx.headers.sorted_fragments(&LexicalSorter);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].as_string(), "auth=pass (authenticated as alice)");
    }

    #[tokio::test]
    async fn unauthenticated_sender_stays_quiet() {
        let mut ctx = ConnectionContext::new(Arc::new(Config::default()));

        Auth::new().envfrom(&mut ctx, "<alice@example.com>").await.unwrap();

        assert!(!ctx.is_authenticated());
        assert!(ctx.headers.sorted_fragments(&LexicalSorter).is_empty());
    }
}
