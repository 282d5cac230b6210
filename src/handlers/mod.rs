//! The authentication handler contract and the concrete handlers.
//!
//! A handler is a named object implementing any subset of the MTA callback
//! set. Handlers are stateless between connections; per-connection private
//! state lives in the connection context, keyed by handler name.

use std::cmp::Ordering;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    headers::AuthFragment,
    metrics::MetricsRegistry,
    pipeline::ConnectionContext,
    timeout::TimeoutClass,
};

pub mod registry;

mod add_id;
mod aligned_from;
mod auth;
mod dkim;
mod dmarc;
mod iprev;
mod local_ip;
mod ptr;
mod return_ok;
mod sanitize;
mod sender_id;
mod size;
mod spf;
mod tls;
mod trusted_ip;
mod x_google_dkim;

pub use add_id::AddId;
pub use aligned_from::AlignedFrom;
pub use auth::Auth;
pub use dkim::Dkim;
pub use dmarc::Dmarc;
pub use iprev::IpRev;
pub use local_ip::LocalIp;
pub use ptr::Ptr;
pub use return_ok::ReturnOk;
pub use sanitize::Sanitize;
pub use sender_id::SenderId;
pub use size::Size;
pub use spf::Spf;
pub use tls::Tls;
pub use trusted_ip::TrustedIp;
pub use x_google_dkim::XGoogleDkim;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The tagged timeout failure. Intermediate recovery sites re-raise it;
    /// only the controller's event loop converts it into an event outcome.
    #[error("timeout at {site}")]
    Timeout { site: &'static str },
    #[error("invalid handler configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Fail(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HandlerError::Timeout { .. })
    }

    /// The `type` label used on `callback_error_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Timeout { .. } => "Timeout",
            HandlerError::Config(_) => "Config",
            HandlerError::Fail(_) => "Handler",
            HandlerError::Internal(_) => "Internal",
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// The MTA event alphabet driving the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Setup,
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Header,
    Eoh,
    Body,
    Eom,
    Abort,
    Close,
    AddHeader,
}

impl Event {
    pub const ALL: [Event; 12] = [
        Event::Setup,
        Event::Connect,
        Event::Helo,
        Event::EnvFrom,
        Event::EnvRcpt,
        Event::Header,
        Event::Eoh,
        Event::Body,
        Event::Eom,
        Event::Abort,
        Event::Close,
        Event::AddHeader,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Setup => "setup",
            Event::Connect => "connect",
            Event::Helo => "helo",
            Event::EnvFrom => "envfrom",
            Event::EnvRcpt => "envrcpt",
            Event::Header => "header",
            Event::Eoh => "eoh",
            Event::Body => "body",
            Event::Eom => "eom",
            Event::Abort => "abort",
            Event::Close => "close",
            Event::AddHeader => "addheader",
        }
    }

    /// The section timeout class this event is budgeted under.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Event::Setup | Event::Connect => TimeoutClass::Connect,
            Event::Helo | Event::EnvFrom | Event::EnvRcpt | Event::Abort | Event::Close => {
                TimeoutClass::Command
            }
            Event::Header | Event::Eoh | Event::Body | Event::Eom => TimeoutClass::Content,
            Event::AddHeader => TimeoutClass::AddHeader,
        }
    }
}

/// Contract implemented by every authentication handler. All callbacks
/// default to no-ops; `callbacks()` declares which events the handler wants
/// dispatched.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// The events this handler subscribes to.
    fn callbacks(&self) -> &'static [Event];

    /// Handler names that must be loaded earlier in the chain.
    fn requires(&self) -> &'static [&'static str] {
        &[]
    }

    async fn setup(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    async fn connect(&self, _ctx: &mut ConnectionContext, _hostname: &str) -> HandlerResult {
        Ok(())
    }

    async fn helo(&self, _ctx: &mut ConnectionContext, _helo_host: &str) -> HandlerResult {
        Ok(())
    }

    async fn envfrom(&self, _ctx: &mut ConnectionContext, _from: &str) -> HandlerResult {
        Ok(())
    }

    async fn envrcpt(&self, _ctx: &mut ConnectionContext, _rcpt: &str) -> HandlerResult {
        Ok(())
    }

    async fn header(&self, _ctx: &mut ConnectionContext, _name: &str, _value: &str) -> HandlerResult {
        Ok(())
    }

    async fn eoh(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    async fn body(&self, _ctx: &mut ConnectionContext, _chunk: &[u8]) -> HandlerResult {
        Ok(())
    }

    async fn eom(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    async fn abort(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    async fn close(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    /// Runs after the headers for the current message have been composed,
    /// before they are flushed to the transport.
    async fn addheader(&self, _ctx: &mut ConnectionContext) -> HandlerResult {
        Ok(())
    }

    fn register_metrics(&self, _registry: &MetricsRegistry) {}

    fn default_config(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Whether this handler orders fragments with the given lower-cased key.
    fn can_sort_header(&self, _name: &str) -> bool {
        false
    }

    fn handler_header_sort(&self, a: &AuthFragment, b: &AuthFragment) -> Ordering {
        a.as_string().cmp(&b.as_string())
    }
}

/// Dispatch one event to one handler.
pub async fn dispatch(
    handler: &dyn Handler,
    event: Event,
    args: &EventArgs<'_>,
    ctx: &mut ConnectionContext,
) -> HandlerResult {
    match (event, args) {
        (Event::Setup, _) => handler.setup(ctx).await,
        (Event::Connect, EventArgs::Connect { hostname }) => handler.connect(ctx, hostname).await,
        (Event::Helo, EventArgs::Helo { helo_host }) => handler.helo(ctx, helo_host).await,
        (Event::EnvFrom, EventArgs::EnvFrom { from }) => handler.envfrom(ctx, from).await,
        (Event::EnvRcpt, EventArgs::EnvRcpt { rcpt }) => handler.envrcpt(ctx, rcpt).await,
        (Event::Header, EventArgs::Header { name, value }) => {
            handler.header(ctx, name, value).await
        }
        (Event::Eoh, _) => handler.eoh(ctx).await,
        (Event::Body, EventArgs::Body { chunk }) => handler.body(ctx, chunk).await,
        (Event::Eom, _) => handler.eom(ctx).await,
        (Event::Abort, _) => handler.abort(ctx).await,
        (Event::Close, _) => handler.close(ctx).await,
        (Event::AddHeader, _) => handler.addheader(ctx).await,
        (event, _) => Err(HandlerError::Internal(format!(
            "event {} dispatched with mismatched arguments",
            event.as_str()
        ))),
    }
}

/// Arguments accompanying an event.
#[derive(Debug, Clone, Copy)]
pub enum EventArgs<'a> {
    None,
    Connect { hostname: &'a str },
    Helo { helo_host: &'a str },
    EnvFrom { from: &'a str },
    EnvRcpt { rcpt: &'a str },
    Header { name: &'a str, value: &'a str },
    Body { chunk: &'a [u8] },
}

/// Outcome of an operation guarded by a handler-local deadline.
pub(crate) enum Guarded<T> {
    Ok(T),
    /// The handler-local budget ran out while the outer budgets still have
    /// time left; the handler downgrades its verdict to `temperror`.
    TimedOut,
}

/// Run one blocking operation under a handler-local deadline, clamped to the
/// remaining section/overall budget. When the outer budget is spent the
/// tagged Timeout failure propagates; a purely local expiry is reported as
/// [`Guarded::TimedOut`].
pub(crate) async fn with_handler_deadline<T>(
    deadlines: &mut crate::timeout::Deadlines,
    budget: std::time::Duration,
    site: &'static str,
    operation: impl std::future::Future<Output = T>,
) -> Result<Guarded<T>, HandlerError> {
    let deadline = deadlines.arm_handler(budget, site)?;
    let result = tokio::time::timeout_at(deadline, operation).await;
    deadlines.reset_to_outer(site)?;
    Ok(match result {
        Ok(value) => Guarded::Ok(value),
        Err(_) => Guarded::TimedOut,
    })
}

/// Deserialize a handler's configuration section; `null` (absent) gives the
/// defaults.
pub(crate) fn parse_handler_config<T: Default + serde::de::DeserializeOwned>(
    handler: &'static str,
    section: &serde_json::Value,
) -> Result<T, registry::RegistryError> {
    if section.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(section.clone()).map_err(|e| registry::RegistryError::HandlerConfig {
        handler: handler.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn spf_result_str(result: mail_auth::SpfResult) -> &'static str {
    use mail_auth::SpfResult;
    match result {
        SpfResult::Pass => "pass",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::Neutral => "neutral",
        SpfResult::TempError => "temperror",
        SpfResult::PermError => "permerror",
        SpfResult::None => "none",
    }
}

pub(crate) fn dkim_result_str(result: &mail_auth::DkimResult) -> &'static str {
    use mail_auth::DkimResult;
    match result {
        DkimResult::Pass => "pass",
        DkimResult::Neutral(_) => "neutral",
        DkimResult::Fail(_) => "fail",
        DkimResult::PermError(_) => "permerror",
        DkimResult::TempError(_) => "temperror",
        DkimResult::None => "none",
    }
}

/// The DNS budget a handler arms around a single lookup.
pub(crate) fn dns_budget(config: &crate::config::Config) -> std::time::Duration {
    std::time::Duration::from_secs(config.dns.dns_timeout.max(1))
}
