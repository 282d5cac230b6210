//! Strips forged `Authentication-Results` headers claiming to be ours.
//!
//! An upstream sender could pre-load the message with an
//! `Authentication-Results` header carrying our authserv-id; anything
//! downstream would then trust verdicts we never produced.

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    pipeline::ConnectionContext,
};

pub struct Sanitize;

impl Sanitize {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sanitize {
    fn default() -> Self {
        Self::new()
    }
}

/// The authserv-id is the first token of the header value.
fn authserv_id(value: &str) -> &str {
    value
        .trim_start()
        .split(|c: char| c == ';' || c.is_whitespace())
        .next()
        .unwrap_or("")
}

#[async_trait]
impl Handler for Sanitize {
    fn name(&self) -> &'static str {
        "Sanitize"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Header]
    }

    async fn header(&self, ctx: &mut ConnectionContext, name: &str, value: &str) -> HandlerResult {
        if !name.eq_ignore_ascii_case("Authentication-Results") {
            return Ok(());
        }

        let id = authserv_id(value).to_ascii_lowercase();
        let ours = id == ctx.config.hostname.to_ascii_lowercase()
            || ctx
                .config
                .hosts_to_remove
                .iter()
                .any(|host| host.to_ascii_lowercase() == id);
        if !ours {
            return Ok(());
        }

        ctx.dbg("sanitize", format!("removing forged Authentication-Results from {id}"));

        let Some(message) = ctx.message_mut() else {
            return Ok(());
        };

        // The pipeline already captured this header, so its occurrence index
        // is the count of same-named headers seen so far.
        let index = message
            .headers_list
            .iter()
            .filter(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .count() as u32;
        message.remove_headers.push((name.to_string(), index));

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn authserv_id_extraction() {
        assert_eq!(authserv_id("mx.example.com; spf=pass"), "mx.example.com");
        assert_eq!(authserv_id("  mx.example.com;\n    none"), "mx.example.com");
        assert_eq!(authserv_id(""), "");
    }
}
