//! Classifies connections from loopback, link-local and private addresses.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::{
    handlers::{Event, Handler, HandlerResult},
    headers::AuthEntry,
    pipeline::ConnectionContext,
};

pub struct LocalIp;

impl LocalIp {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalIp {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local
                || (segments[0] & 0xffc0) == 0xfe80
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}

#[async_trait]
impl Handler for LocalIp {
    fn name(&self) -> &'static str {
        "LocalIP"
    }

    fn callbacks(&self) -> &'static [Event] {
        &[Event::Connect]
    }

    async fn connect(&self, ctx: &mut ConnectionContext, _hostname: &str) -> HandlerResult {
        let Some(ip) = ctx.ip() else {
            return Ok(());
        };

        if is_local_ip(ip) {
            ctx.dbg("local-ip", ip.to_string());
            ctx.set_local();
            ctx.headers
                .add_c_auth_header(AuthEntry::new("x-local-ip", "pass").prop("policy.local", ip.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classification() {
        assert!(is_local_ip("127.0.0.1".parse().unwrap()));
        assert!(is_local_ip("10.1.2.3".parse().unwrap()));
        assert!(is_local_ip("192.168.0.9".parse().unwrap()));
        assert!(is_local_ip("::1".parse().unwrap()));
        assert!(is_local_ip("fe80::1".parse().unwrap()));
        assert!(is_local_ip("fd00::1".parse().unwrap()));

        assert!(!is_local_ip("192.0.2.10".parse().unwrap()));
        assert!(!is_local_ip("2001:db8::1".parse().unwrap()));
    }
}
