//! The staged state machine driving one connection.
//!
//! The transport parses MTA events and calls the matching `top_*`
//! entrypoint. The controller records its status, arms the section deadline,
//! dispatches the event to the ordered handler chain, accumulates headers
//! and disposition, and hands a single response back to the transport.

use std::{
    any::Any,
    collections::HashMap,
    hash::{Hash, Hasher},
    net::IpAddr,
    sync::Arc,
};

use mail_auth::MessageAuthenticator;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::{
    config::Config,
    disposition::{Disposition, ReturnCode},
    dns::DnsResolver,
    handlers::{dispatch, Event, EventArgs, HandlerError},
    handlers::registry::Registry,
    headers::{Header, HeaderAccumulator},
    metrics::{self, MetricsRecorder, MetricsRegistry},
    objects::{ObjectStore, SharedObject},
    symbols::SymbolTable,
    timeout::Deadlines,
};

/// One response per MTA event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResponse {
    pub code: ReturnCode,
    pub reason: Option<String>,
}

impl EventResponse {
    fn r#continue() -> Self {
        Self {
            code: ReturnCode::Continue,
            reason: None,
        }
    }
}

/// Header mutations queued for the transport, emitted at EOM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Insert { index: u32, name: String, value: String },
    Add { name: String, value: String },
    /// An empty value deletes occurrence `index` of the named header.
    Change { name: String, index: u32, value: String },
    Quarantine { reason: String },
}

/// Where pipeline status labels go. The default sink records the label for
/// an external process monitor and emits a trace event.
pub trait StatusSink: Send {
    fn status(&mut self, label: &str);
}

pub struct TraceStatusSink;

impl StatusSink for TraceStatusSink {
    fn status(&mut self, label: &str) {
        trace!(status = label, "pipeline status");
    }
}

/// Everything with connection lifetime.
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub symbols: SymbolTable,
    pub objects: ObjectStore,
    pub headers: HeaderAccumulator,
    pub disposition: Disposition,
    pub deadlines: Deadlines,

    raw_ip: Option<IpAddr>,
    ip: Option<IpAddr>,
    raw_helo: Option<String>,
    helo_name: Option<String>,

    is_local: bool,
    is_trusted: bool,
    is_authenticated: bool,
    verified_ptr: Option<String>,

    exit_on_close: bool,
    status: String,
    connect_count: u64,
    queue_id: Option<String>,
    synthetic_queue_id: Option<String>,

    dbgout: Vec<(String, String)>,
    handler_state: HashMap<&'static str, Box<dyn Any + Send + Sync>>,

    message: Option<MessageContext>,
}

/// Everything with message lifetime (MAIL FROM → EOM-or-ABORT).
#[derive(Default)]
pub struct MessageContext {
    pub env_from: Option<String>,
    pub env_rcpt: Vec<String>,
    pub headers_list: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// `(name, occurrence index)` of inbound headers queued for deletion.
    pub remove_headers: Vec<(String, u32)>,
}

impl MessageContext {
    /// The captured message as transferred, headers then body.
    pub fn raw_message(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.body.len() + 512);
        for (name, value) in &self.headers_list {
            raw.extend_from_slice(name.as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.body);
        raw
    }
}

impl ConnectionContext {
    pub fn new(config: Arc<Config>) -> Self {
        let mut objects = ObjectStore::new();

        objects.register_factory(
            "resolver",
            false,
            Box::new(|config: &Config| {
                Ok(Arc::new(DnsResolver::new(&config.dns)) as SharedObject)
            }),
        );
        objects.register_factory(
            "spf_server",
            false,
            Box::new(|config: &Config| build_authenticator(config)),
        );

        Self {
            config,
            symbols: SymbolTable::new(),
            objects,
            headers: HeaderAccumulator::new(),
            disposition: Disposition::new(),
            deadlines: Deadlines::new(),
            raw_ip: None,
            ip: None,
            raw_helo: None,
            helo_name: None,
            is_local: false,
            is_trusted: false,
            is_authenticated: false,
            verified_ptr: None,
            exit_on_close: false,
            status: "setup".to_string(),
            connect_count: 0,
            queue_id: None,
            synthetic_queue_id: None,
            dbgout: Vec::new(),
            handler_state: HashMap::new(),
            message: None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn raw_ip(&self) -> Option<IpAddr> {
        self.raw_ip
    }

    pub fn helo_name(&self) -> Option<&str> {
        self.helo_name.as_deref()
    }

    pub fn raw_helo(&self) -> Option<&str> {
        self.raw_helo.as_deref()
    }

    pub fn message(&self) -> Option<&MessageContext> {
        self.message.as_ref()
    }

    /// The last status label published by the controller.
    pub fn current_status(&self) -> &str {
        &self.status
    }

    pub fn message_mut(&mut self) -> Option<&mut MessageContext> {
        self.message.as_mut()
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn set_local(&mut self) {
        self.is_local = true;
    }

    pub fn is_trusted(&self) -> bool {
        self.is_trusted
    }

    pub fn set_trusted(&mut self) {
        self.is_trusted = true;
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn set_authenticated(&mut self) {
        self.is_authenticated = true;
    }

    /// Authentication checks are pointless for our own traffic.
    pub fn skip_auth_checks(&self) -> bool {
        self.is_local || self.is_trusted || self.is_authenticated
    }

    pub fn verified_ptr(&self) -> Option<&str> {
        self.verified_ptr.as_deref()
    }

    pub fn set_verified_ptr(&mut self, domain: impl Into<String>) {
        self.verified_ptr = Some(domain.into());
    }

    pub fn exit_on_close(&mut self) {
        self.exit_on_close = true;
    }

    pub fn should_exit_on_close(&self) -> bool {
        self.exit_on_close
    }

    /// The MTA queue id when known, a stable synthetic id otherwise.
    pub fn queue_id(&mut self) -> String {
        if let Some(id) = self.symbols.get("i") {
            return id.to_string();
        }
        if let Some(id) = &self.queue_id {
            return id.clone();
        }
        self.synthetic_queue_id
            .get_or_insert_with(synthetic_queue_id)
            .clone()
    }

    /// Buffer a debug item, flushed as queue-id-prefixed lines at close.
    pub fn dbg(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dbgout.push((key.into(), value.into()));
    }

    /// Typed per-handler private state, created on first access.
    pub fn handler_state<T: Any + Send + Sync + Default>(&mut self, name: &'static str) -> &mut T {
        self.handler_state
            .entry(name)
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut::<T>()
            .expect("handler state type is fixed per handler name")
    }

    /// Read-only view of another handler's state, when it exists.
    pub fn peek_state<T: Any + Send + Sync>(&self, name: &'static str) -> Option<&T> {
        self.handler_state
            .get(name)
            .and_then(|state| state.downcast_ref::<T>())
    }

    pub fn resolver(&mut self) -> Result<Arc<DnsResolver>, HandlerError> {
        let config = self.config.clone();
        self.objects
            .get_typed::<DnsResolver>("resolver", &config)?
            .ok_or_else(|| HandlerError::Internal("resolver factory missing".to_string()))
    }

    pub fn spf_server(&mut self) -> Result<Arc<MessageAuthenticator>, HandlerError> {
        let config = self.config.clone();
        self.objects
            .get_typed::<MessageAuthenticator>("spf_server", &config)?
            .ok_or_else(|| HandlerError::Internal("spf_server factory missing".to_string()))
    }
}

fn build_authenticator(config: &Config) -> Result<SharedObject, HandlerError> {
    use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
    use hickory_resolver::proto::xfer::Protocol;

    let mut options = ResolverOpts::default();
    options.timeout = std::time::Duration::from_secs(config.dns.dns_timeout);
    options.attempts = config.dns.dns_retry;

    let authenticator = if config.dns.dns_resolvers.is_empty() {
        MessageAuthenticator::new_system_conf()
            .map_err(|e| HandlerError::Internal(format!("failed to build authenticator: {e}")))?
    } else {
        let mut resolver_config = ResolverConfig::new();
        for nameserver in &config.dns.dns_resolvers {
            let socket_addr = match nameserver.parse() {
                Ok(addr) => addr,
                Err(_) => match nameserver.parse::<IpAddr>() {
                    Ok(ip) => std::net::SocketAddr::new(ip, 53),
                    Err(_) => continue,
                },
            };
            resolver_config.add_name_server(NameServerConfig {
                socket_addr,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                http_endpoint: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        MessageAuthenticator::new(resolver_config, options)
            .map_err(|e| HandlerError::Internal(format!("failed to build authenticator: {e}")))?
    };

    Ok(Arc::new(authenticator) as SharedObject)
}

fn synthetic_queue_id() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut hasher = std::hash::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    rand::random::<u64>().hash(&mut hasher);

    let mut value = hasher.finish();
    let suffix: String = (0..11)
        .map(|_| {
            let c = ALPHABET[(value & 31) as usize] as char;
            value >>= 5;
            c
        })
        .collect();
    format!("NOQUEUE.{suffix}")
}

pub struct Pipeline {
    registry: Arc<Registry>,
    metrics: MetricsRecorder,
    status_sink: Box<dyn StatusSink>,
    header_ops: Vec<HeaderOp>,
    pub ctx: ConnectionContext,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        metrics_registry: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            metrics: MetricsRecorder::new(metrics_registry),
            status_sink: Box::new(TraceStatusSink),
            header_ops: Vec::new(),
            ctx: ConnectionContext::new(config),
        }
    }

    pub fn with_status_sink(mut self, sink: Box<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    fn status(&mut self, label: &str) {
        self.ctx.status = label.to_string();
        self.status_sink.status(label);
    }

    /// Header mutations composed at EOM, for the transport to flush.
    pub fn take_header_ops(&mut self) -> Vec<HeaderOp> {
        std::mem::take(&mut self.header_ops)
    }

    pub async fn top_setup(&mut self) -> EventResponse {
        self.handle_event(Event::Setup, EventArgs::None).await
    }

    pub async fn top_connect(&mut self, hostname: &str, ip: Option<IpAddr>) -> EventResponse {
        self.ctx.connect_count += 1;
        self.metrics.count(metrics::CONNECT_TOTAL, &[], 1);
        self.ctx.disposition.clear();

        self.ctx.raw_ip = ip;
        self.ctx.ip = ip.map(|ip| {
            match self.ctx.config.remap_for(ip).and_then(|entry| entry.ip) {
                Some(mapped) => {
                    info!("remapping connecting ip {ip} to {mapped}");
                    mapped
                }
                None => ip,
            }
        });

        self.handle_event(Event::Connect, EventArgs::Connect { hostname })
            .await
    }

    pub async fn top_helo(&mut self, helo_host: &str) -> EventResponse {
        if self.ctx.helo_name.is_some() {
            // Only the first HELO of a connection counts.
            debug!("additional HELO {helo_host} ignored");
            self.ctx.dbg("helo", format!("additional HELO ignored: {helo_host}"));
            return EventResponse::r#continue();
        }

        self.ctx.raw_helo = Some(helo_host.to_string());
        let effective = self
            .ctx
            .raw_ip
            .and_then(|ip| self.ctx.config.remap_for(ip))
            .and_then(|entry| entry.helo.clone())
            .unwrap_or_else(|| helo_host.to_string());
        self.ctx.helo_name = Some(effective.clone());

        self.handle_event(
            Event::Helo,
            EventArgs::Helo {
                helo_host: &effective,
            },
        )
        .await
    }

    pub async fn top_envfrom(&mut self, from: &str) -> EventResponse {
        self.ctx.message = Some(MessageContext {
            env_from: Some(from.to_string()),
            ..Default::default()
        });

        self.handle_event(Event::EnvFrom, EventArgs::EnvFrom { from })
            .await
    }

    pub async fn top_envrcpt(&mut self, rcpt: &str) -> EventResponse {
        if let Some(message) = self.ctx.message.as_mut() {
            message.env_rcpt.push(rcpt.to_string());
        }
        self.handle_event(Event::EnvRcpt, EventArgs::EnvRcpt { rcpt })
            .await
    }

    pub async fn top_header(&mut self, name: &str, value: &str) -> EventResponse {
        if let Some(message) = self.ctx.message.as_mut() {
            message
                .headers_list
                .push((name.to_string(), value.to_string()));
        }
        self.handle_event(Event::Header, EventArgs::Header { name, value })
            .await
    }

    pub async fn top_eoh(&mut self) -> EventResponse {
        self.handle_event(Event::Eoh, EventArgs::None).await
    }

    pub async fn top_body(&mut self, chunk: &[u8]) -> EventResponse {
        if let Some(message) = self.ctx.message.as_mut() {
            message.body.extend_from_slice(chunk);
        }
        self.handle_event(Event::Body, EventArgs::Body { chunk })
            .await
    }

    pub async fn top_eom(&mut self) -> EventResponse {
        let response = self.handle_event(Event::Eom, EventArgs::None).await;

        self.apply_policy();
        self.compose_header_ops();

        // addheader callbacks inspect and may mutate the queued headers
        // before they are flushed.
        let addheader_response = self.handle_event(Event::AddHeader, EventArgs::None).await;
        self.flush_header_queues();

        if self.ctx.config.dryrun {
            debug!("dryrun: suppressing {} header mutations", self.header_ops.len());
            self.header_ops.clear();
        }

        self.end_of_message();

        // A failure during addheader still tempfails the message.
        if addheader_response.code != ReturnCode::Continue {
            return addheader_response;
        }
        response
    }

    pub async fn top_abort(&mut self) -> EventResponse {
        let response = self.handle_event(Event::Abort, EventArgs::None).await;
        self.end_of_message();
        response
    }

    pub async fn top_close(&mut self) -> EventResponse {
        let response = self.handle_event(Event::Close, EventArgs::None).await;

        self.flush_debug_log();
        self.ctx.symbols.clear_all_symbols();
        self.ctx.objects.clear();
        self.ctx.headers.clear();
        self.ctx.message = None;
        self.metrics.send();

        self.status("postclose");
        response
    }

    /// The declared policy extension point. Nothing hooks it yet.
    fn apply_policy(&mut self) {}

    /// Build the ordered header mutations for this message.
    fn compose_header_ops(&mut self) {
        let format = self.ctx.config.header_format();
        let value =
            self.ctx
                .headers
                .serialize_auth_results(&self.ctx.config.hostname, &format, self.registry.as_ref());

        self.header_ops.clear();
        // Authentication-Results is always the first inserted header.
        self.header_ops.push(HeaderOp::Insert {
            index: 1,
            name: "Authentication-Results".to_string(),
            value,
        });

        if let Some(reason) = self.ctx.disposition.quarantine_reason() {
            self.header_ops.push(HeaderOp::Insert {
                index: 2,
                name: "X-Disposition-Quarantine".to_string(),
                value: reason.to_string(),
            });
            self.header_ops.push(HeaderOp::Quarantine {
                reason: reason.to_string(),
            });
        }

        // Deletions queued by the Sanitize handler.
        if let Some(message) = self.ctx.message.as_ref() {
            for (name, index) in &message.remove_headers {
                self.header_ops.push(HeaderOp::Change {
                    name: name.clone(),
                    index: *index,
                    value: String::new(),
                });
            }
        }
    }

    /// Move the pre/append queues into transport ops, after the addheader
    /// callbacks had their chance to rewrite them.
    fn flush_header_queues(&mut self) {
        let mut index = self
            .header_ops
            .iter()
            .filter(|op| matches!(op, HeaderOp::Insert { .. }))
            .count() as u32;

        let pre_headers: Vec<Header> = self.ctx.headers.pre_headers_mut().drain(..).collect();
        for header in pre_headers {
            index += 1;
            self.header_ops.push(HeaderOp::Insert {
                index,
                name: header.name,
                value: header.value,
            });
        }

        let add_headers: Vec<Header> = self.ctx.headers.add_headers_mut().drain(..).collect();
        for header in add_headers {
            self.header_ops.push(HeaderOp::Add {
                name: header.name,
                value: header.value,
            });
        }
    }

    /// Between-messages cleanup shared by EOM and ABORT.
    fn end_of_message(&mut self) {
        self.ctx.message = None;
        self.ctx.headers.clear_message();
        self.ctx.symbols.clear_symbols();
        self.ctx.objects.destroy_objects();
        self.ctx.disposition.clear();
        self.ctx.queue_id = None;
    }

    fn flush_debug_log(&mut self) {
        let queue_id = self.ctx.queue_id();
        for (key, value) in std::mem::take(&mut self.ctx.dbgout) {
            debug!("{queue_id}: {key}: {value}");
        }
    }

    async fn handle_event(&mut self, event: Event, args: EventArgs<'_>) -> EventResponse {
        self.status(event.as_str());
        self.ctx.disposition.set_return(ReturnCode::Continue);

        let budget = self.ctx.config.get_type_timeout(event.timeout_class());
        self.ctx.deadlines.arm_section(budget);

        for handler in self.registry.get_callbacks(event) {
            let start = Instant::now();
            let result = dispatch(handler.as_ref(), event, &args, &mut self.ctx).await;
            let elapsed = start.elapsed().as_micros() as u64;
            self.metrics.count(
                metrics::TIME_MICROSECONDS_TOTAL,
                &[("callback", event.as_str()), ("handler", handler.name())],
                elapsed,
            );

            match result {
                Ok(()) => {}
                Err(err) if err.is_timeout() => {
                    self.on_callback_failure(event, None, &err);
                    break;
                }
                Err(err) => {
                    self.on_callback_failure(event, Some(handler.name()), &err);
                }
            }

            if let Err(err) = self.ctx.deadlines.check_now(event.as_str()) {
                self.on_callback_failure(event, None, &err);
                break;
            }
        }

        self.ctx.deadlines.disarm_section();
        self.status(&format!("post{}", event.as_str()));
        self.metrics.send();

        EventResponse {
            code: self.ctx.disposition.get_return(),
            reason: self.ctx.disposition.reason().map(str::to_string),
        }
    }

    fn on_callback_failure(&mut self, event: Event, handler: Option<&str>, err: &HandlerError) {
        let queue_id = self.ctx.queue_id();
        error!(
            "{queue_id}: {}: callback failed in {} handler: {err}",
            event.as_str(),
            handler.unwrap_or("-"),
        );

        match handler {
            Some(handler) => self.metrics.count(
                metrics::CALLBACK_ERROR_TOTAL,
                &[
                    ("stage", event.as_str()),
                    ("handler", handler),
                    ("type", err.kind()),
                ],
                1,
            ),
            None => self.metrics.count(
                metrics::CALLBACK_ERROR_TOTAL,
                &[("stage", event.as_str()), ("type", err.kind())],
                1,
            ),
        }

        self.ctx.exit_on_close();
        self.tempfail_on_error();
    }

    /// Force a tempfail response when the matching policy flag is set. The
    /// connection classification decides which flag applies; classification
    /// requires the corresponding handler to be loaded.
    fn tempfail_on_error(&mut self) {
        let config = &self.ctx.config;
        let flag = if self.registry.is_loaded("Auth") && self.ctx.is_authenticated() {
            config.tempfail_on_error_authenticated
        } else if self.registry.is_loaded("LocalIP") && self.ctx.is_local() {
            config.tempfail_on_error_local
        } else if self.registry.is_loaded("TrustedIP") && self.ctx.is_trusted() {
            config.tempfail_on_error_trusted
        } else {
            config.tempfail_on_error
        };

        if flag {
            self.ctx.disposition.set_return(ReturnCode::Tempfail);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use tracing_test::traced_test;

    use crate::{
        dns::{mock, DnsResolver},
        headers::LexicalSorter,
    };

    fn test_config(handlers: &[&str]) -> Config {
        let mut config = Config::default();
        config.hostname = "mx.example.com".to_string();
        config.load_handlers = handlers.iter().map(|s| s.to_string()).collect();
        config
    }

    fn example_tables() -> mock::Resolver {
        let mut tables = mock::Resolver::default();
        tables.ptr.insert(
            "192.0.2.10".parse().unwrap(),
            vec!["mail.example.com".to_string()],
        );
        tables.a.insert(
            "mail.example.com".to_string(),
            vec!["192.0.2.10".parse().unwrap()],
        );
        tables
    }

    fn test_pipeline(
        config: Config,
        tables: mock::Resolver,
        metrics: Arc<MetricsRegistry>,
    ) -> Pipeline {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::from_config(&config).unwrap());
        let mut pipeline = Pipeline::new(config, registry, metrics);
        pipeline
            .ctx
            .objects
            .set("resolver", Arc::new(DnsResolver::mock(tables)), false);
        pipeline
    }

    fn auth_results(ops: &[HeaderOp]) -> &str {
        match ops.first() {
            Some(HeaderOp::Insert { index: 1, name, value }) if name == "Authentication-Results" => {
                value
            }
            other => panic!("Authentication-Results is not the first inserted header: {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_pass_emits_iprev_and_marker_header() {
        let metrics = MetricsRegistry::new();
        let mut pipeline = test_pipeline(
            test_config(&["LocalIP", "TrustedIP", "IPrev", "AddID"]),
            example_tables(),
            metrics.clone(),
        );

        pipeline.top_setup().await;
        let response = pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        assert_eq!(response.code, ReturnCode::Continue);

        assert_eq!(
            pipeline.top_helo("mail.example.com").await.code,
            ReturnCode::Continue
        );
        pipeline.top_envfrom("<alice@example.com>").await;
        pipeline.top_envrcpt("<bob@example.net>").await;
        pipeline.top_header("From", "alice@example.com").await;
        pipeline
            .top_header("DKIM-Signature", "v=1; a=rsa-sha256; d=example.com; s=sel; b=dGVzdA==")
            .await;
        pipeline.top_eoh().await;
        pipeline.top_body(b"Hello world\r\n").await;

        let response = pipeline.top_eom().await;
        assert_eq!(response.code, ReturnCode::Continue);

        let ops = pipeline.take_header_ops();
        let value = auth_results(&ops);
        assert!(value.starts_with("mx.example.com;"), "{value}");
        assert!(value.contains("iprev=pass"), "{value}");
        assert!(value.contains("policy.iprev=192.0.2.10"), "{value}");
        assert!(value.contains("(mail.example.com)"), "{value}");

        assert!(ops.contains(&HeaderOp::Add {
            name: "X-Authentication-Milter".to_string(),
            value: "Header added by Authentication Milter".to_string(),
        }));

        assert_eq!(pipeline.ctx.verified_ptr(), Some("mail.example.com"));
        assert_eq!(pipeline.ctx.current_status(), "posteom");
        assert_eq!(metrics.get(metrics::CONNECT_TOTAL, &[]), 1);
        assert_eq!(metrics.get_summed(metrics::CALLBACK_ERROR_TOTAL), 0);

        pipeline.top_close().await;
        assert!(!pipeline.ctx.should_exit_on_close());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_dns_times_out_the_connect_event() {
        let mut config = test_config(&["IPrev"]);
        config.connect_timeout = 2;

        let mut tables = example_tables();
        tables.delay = Some(Duration::from_secs(20));

        let metrics = MetricsRegistry::new();
        let mut pipeline = test_pipeline(config, tables, metrics.clone());

        let response = pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;

        assert_eq!(response.code, ReturnCode::Tempfail);
        assert!(pipeline.ctx.should_exit_on_close());
        assert_eq!(
            metrics.get(
                metrics::CALLBACK_ERROR_TOTAL,
                &[("stage", "connect"), ("type", "Timeout")]
            ),
            1
        );
        // the event unwound before IPrev could record a fragment
        assert!(pipeline.ctx.headers.sorted_fragments(&LexicalSorter).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_dns_within_section_budget_is_temperror() {
        let mut config = test_config(&["IPrev"]);
        config.connect_timeout = 30;
        config.dns.dns_timeout = 1;

        let mut tables = example_tables();
        tables.delay = Some(Duration::from_secs(5));

        let mut pipeline = test_pipeline(config, tables, MetricsRegistry::new());
        let response = pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;

        assert_eq!(response.code, ReturnCode::Continue);
        assert!(!pipeline.ctx.should_exit_on_close());

        let fragments = pipeline.ctx.headers.sorted_fragments(&LexicalSorter);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].as_string().starts_with("iprev=temperror"));
    }

    #[tokio::test]
    async fn ip_map_remaps_address_and_helo() {
        let mut config = test_config(&[]);
        config.ip_map.insert(
            "198.51.100.0/24".to_string(),
            crate::config::IpMapEntry {
                ip: Some("192.0.2.5".parse().unwrap()),
                helo: Some("masked.example".to_string()),
            },
        );

        let mut pipeline = test_pipeline(config, mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("orig.example", Some("198.51.100.77".parse().unwrap()))
            .await;
        pipeline.top_helo("orig.example").await;

        assert_eq!(pipeline.ctx.raw_ip(), Some("198.51.100.77".parse().unwrap()));
        assert_eq!(pipeline.ctx.ip(), Some("192.0.2.5".parse().unwrap()));
        assert_eq!(pipeline.ctx.raw_helo(), Some("orig.example"));
        assert_eq!(pipeline.ctx.helo_name(), Some("masked.example"));
    }

    #[tokio::test]
    #[traced_test]
    async fn second_helo_is_ignored() {
        let mut pipeline =
            test_pipeline(test_config(&[]), mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("a.example", Some("192.0.2.10".parse().unwrap()))
            .await;

        pipeline.top_helo("a.example").await;
        let response = pipeline.top_helo("b.example").await;

        assert_eq!(response.code, ReturnCode::Continue);
        assert_eq!(pipeline.ctx.helo_name(), Some("a.example"));
        assert!(logs_contain("additional HELO"));
    }

    #[tokio::test]
    async fn handler_reject_reason_reaches_the_mta_verbatim() {
        let mut pipeline =
            test_pipeline(test_config(&[]), mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_envfrom("<alice@example.com>").await;

        pipeline.ctx.disposition.reject_mail("550 5.7.1 SPF hardfail");

        let response = pipeline.top_eom().await;
        assert_eq!(response.code, ReturnCode::Reject);
        assert_eq!(response.reason.as_deref(), Some("550 5.7.1 SPF hardfail"));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut config = test_config(&["Size"]);
        config
            .handlers
            .insert("Size".to_string(), serde_json::json!({"max_size": 16}));

        let mut pipeline = test_pipeline(config, mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_envfrom("<alice@example.com>").await;
        pipeline.top_body(b"far too many bytes for this limit").await;

        let response = pipeline.top_eom().await;
        assert_eq!(response.code, ReturnCode::Reject);
        assert!(response.reason.unwrap().starts_with("552 5.3.4"));
    }

    #[tokio::test]
    async fn quarantine_adds_header_and_continues() {
        let mut pipeline =
            test_pipeline(test_config(&[]), mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_envfrom("<alice@example.com>").await;

        pipeline.ctx.disposition.quarantine_mail("policy says so");

        let response = pipeline.top_eom().await;
        assert_eq!(response.code, ReturnCode::Continue);

        let ops = pipeline.take_header_ops();
        auth_results(&ops);
        assert!(matches!(
            &ops[1],
            HeaderOp::Insert { index: 2, name, .. } if name == "X-Disposition-Quarantine"
        ));
        assert!(ops
            .iter()
            .any(|op| matches!(op, HeaderOp::Quarantine { reason } if reason == "policy says so")));
    }

    #[tokio::test]
    async fn sanitize_queues_forged_header_removal() {
        let mut pipeline = test_pipeline(
            test_config(&["Sanitize"]),
            mock::Resolver::default(),
            MetricsRegistry::new(),
        );
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_envfrom("<alice@example.com>").await;
        pipeline
            .top_header("Authentication-Results", "mx.example.com; spf=pass")
            .await;
        pipeline
            .top_header("Authentication-Results", "other.example.net; spf=pass")
            .await;

        pipeline.top_eom().await;
        let ops = pipeline.take_header_ops();

        let removals: Vec<&HeaderOp> = ops
            .iter()
            .filter(|op| matches!(op, HeaderOp::Change { .. }))
            .collect();
        assert_eq!(removals.len(), 1);
        assert!(matches!(
            removals[0],
            HeaderOp::Change { name, index: 1, value } if name == "Authentication-Results" && value.is_empty()
        ));
    }

    #[tokio::test]
    async fn dryrun_suppresses_header_mutations() {
        let mut config = test_config(&["AddID"]);
        config.dryrun = true;

        let mut pipeline = test_pipeline(config, mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_envfrom("<alice@example.com>").await;
        pipeline.top_eom().await;

        assert!(pipeline.take_header_ops().is_empty());
    }

    #[tokio::test]
    async fn abort_drops_the_message_but_keeps_the_connection() {
        let mut pipeline =
            test_pipeline(test_config(&[]), mock::Resolver::default(), MetricsRegistry::new());
        pipeline
            .top_connect("mail.example.com", Some("192.0.2.10".parse().unwrap()))
            .await;
        pipeline.top_helo("mail.example.com").await;
        pipeline.ctx.symbols.set('C', "j", "mx.example.com");
        pipeline.ctx.symbols.set('M', "i", "4FE15A1");

        pipeline.top_envfrom("<alice@example.com>").await;
        pipeline.top_abort().await;

        assert!(pipeline.ctx.message().is_none());
        assert_eq!(pipeline.ctx.helo_name(), Some("mail.example.com"));
        assert_eq!(pipeline.ctx.symbols.get("j"), Some("mx.example.com"));
        assert_eq!(pipeline.ctx.symbols.get("i"), None);

        // the connection accepts a fresh message afterwards
        pipeline.top_envfrom("<carol@example.org>").await;
        assert_eq!(
            pipeline.ctx.message().and_then(|m| m.env_from.as_deref()),
            Some("<carol@example.org>")
        );
    }

    #[tokio::test]
    async fn queue_id_prefers_mta_symbol() {
        let mut pipeline =
            test_pipeline(test_config(&[]), mock::Resolver::default(), MetricsRegistry::new());

        let synthetic = pipeline.ctx.queue_id();
        assert!(synthetic.starts_with("NOQUEUE."));
        assert_eq!(synthetic.len(), "NOQUEUE.".len() + 11);
        // stable for the connection
        assert_eq!(pipeline.ctx.queue_id(), synthetic);

        pipeline.ctx.symbols.set('M', "i", "4FE15A1");
        assert_eq!(pipeline.ctx.queue_id(), "4FE15A1");
    }
}
