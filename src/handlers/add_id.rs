//! Appends the gateway's marker header to every processed message.

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    headers::Header,
    pipeline::ConnectionContext,
};

pub struct AddId;

impl AddId {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AddId {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for AddId {
    fn name(&self) -> &'static str {
        "AddID"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> HandlerResult {
        ctx.headers.append_header(Header::new(
            "X-Authentication-Milter",
            "Header added by Authentication Milter",
        ));
        Ok(())
    }
}
