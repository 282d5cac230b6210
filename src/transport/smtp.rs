//! SMTP proxy front-end.
//!
//! Accepts SMTP, drives the same event sequence as the milter path, applies
//! the queued header mutations to the message text itself, and relays
//! accepted mail to the configured downstream server.

use std::net::SocketAddr;

use smtp_proto::{
    EhloResponse, Request, EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};

use crate::{
    disposition::ReturnCode,
    pipeline::{EventResponse, HeaderOp, Pipeline},
    transport::TransportError,
};

const BUFFER_SIZE: usize = 64 * 1024;
const MAX_DATA_SIZE: usize = 100 * 1024 * 1024;

pub struct SmtpProxy {
    pipeline: Pipeline,
    server_name: String,
    downstream: Option<String>,
}

impl SmtpProxy {
    pub fn new(pipeline: Pipeline, server_name: String, downstream: Option<String>) -> Self {
        Self {
            pipeline,
            server_name,
            downstream,
        }
    }

    /// Serve one SMTP connection. Returns whether the session loop should
    /// terminate instead of accepting further work.
    pub async fn handle(
        mut self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        peer_addr: SocketAddr,
    ) -> Result<bool, TransportError> {
        let (source, mut sink) = tokio::io::split(stream);
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::with_capacity(BUFFER_SIZE);

        self.pipeline.top_setup().await;
        let connect_response = self
            .pipeline
            .top_connect(&peer_addr.ip().to_string(), Some(peer_addr.ip()))
            .await;
        if matches!(
            connect_response.code,
            ReturnCode::Reject | ReturnCode::Tempfail
        ) {
            let line = reply_line(&connect_response, (554, "5.7.1 Connection refused"));
            write_line(&mut sink, &line).await?;
            self.pipeline.top_close().await;
            return Ok(self.pipeline.ctx.should_exit_on_close());
        }

        write_line(&mut sink, &format!("220 {} ESMTP", self.server_name)).await?;

        let mut mail_from: Option<String> = None;
        let mut rcpt_to: Vec<String> = Vec::new();

        loop {
            read_line(&mut reader, &mut buffer).await?;
            let request = match Request::parse(&mut buffer.iter()) {
                Ok(request) => request,
                Err(e) => {
                    debug!("failed to parse request: {e}");
                    write_line(&mut sink, &format!("500 5.5.2 {e}")).await?;
                    continue;
                }
            };

            trace!("received request: {request:?} from {peer_addr}");

            match request {
                Request::Ehlo { host } => {
                    let response = self.pipeline.top_helo(&host).await;
                    if respond_refusal(&mut sink, &response).await? {
                        continue;
                    }

                    let mut ehlo = EhloResponse::new(self.server_name.as_str());
                    ehlo.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;
                    let mut buf = Vec::with_capacity(64);
                    ehlo.write(&mut buf).ok();
                    sink.write_all(&buf).await.map_err(TransportError::Write)?;
                }
                Request::Helo { host } => {
                    let response = self.pipeline.top_helo(&host).await;
                    if respond_refusal(&mut sink, &response).await? {
                        continue;
                    }
                    write_line(&mut sink, &format!("250 {}", self.server_name)).await?;
                }
                Request::Mail { from } => {
                    let response = self.pipeline.top_envfrom(&from.address).await;
                    let line = reply_line(&response, (250, "2.1.0 Originator ok"));
                    if matches!(response.code, ReturnCode::Continue | ReturnCode::Accept) {
                        mail_from = Some(from.address.to_string());
                        rcpt_to.clear();
                    }
                    write_line(&mut sink, &line).await?;
                }
                Request::Rcpt { to } => {
                    if mail_from.is_none() {
                        write_line(&mut sink, "503 5.5.1 Use MAIL first").await?;
                        continue;
                    }
                    let response = self.pipeline.top_envrcpt(&to.address).await;
                    let line = reply_line(&response, (250, "2.1.5 Recipient ok"));
                    if matches!(response.code, ReturnCode::Continue | ReturnCode::Accept) {
                        rcpt_to.push(to.address.to_string());
                    }
                    write_line(&mut sink, &line).await?;
                }
                Request::Data => {
                    if mail_from.is_none() || rcpt_to.is_empty() {
                        write_line(&mut sink, "503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    write_line(&mut sink, "354 3.5.4 Start mail input; end with <CRLF>.<CRLF>")
                        .await?;

                    let data = read_data(&mut reader, &mut buffer).await?;
                    let line = self
                        .process_message(&data, mail_from.take().unwrap_or_default(), &rcpt_to)
                        .await;
                    rcpt_to.clear();
                    write_line(&mut sink, &line).await?;
                }
                Request::Rset => {
                    self.pipeline.top_abort().await;
                    mail_from = None;
                    rcpt_to.clear();
                    write_line(&mut sink, "250 2.0.0 Ok").await?;
                }
                Request::Noop { .. } => {
                    write_line(&mut sink, "250 2.0.0 Ok").await?;
                }
                Request::Quit => {
                    write_line(&mut sink, "221 2.0.0 Goodbye").await?;
                    self.pipeline.top_close().await;
                    break;
                }
                _ => {
                    write_line(&mut sink, "502 5.5.1 Command not implemented").await?;
                }
            }
        }

        Ok(self.pipeline.ctx.should_exit_on_close())
    }

    /// Drive header/eoh/body/eom for one received message and deliver it.
    async fn process_message(&mut self, data: &[u8], mail_from: String, rcpt_to: &[String]) -> String {
        let (headers, body) = split_message(data);

        for (name, value) in &headers {
            self.pipeline.top_header(name, value).await;
        }
        self.pipeline.top_eoh().await;
        if !body.is_empty() {
            self.pipeline.top_body(&body).await;
        }
        let response = self.pipeline.top_eom().await;
        let ops = self.pipeline.take_header_ops();

        match response.code {
            ReturnCode::Continue | ReturnCode::Accept => {}
            ReturnCode::Discard => {
                debug!("discarding message on handler request");
                return "250 2.6.0 Message accepted".to_string();
            }
            _ => return reply_line(&response, (550, "5.7.0 Message rejected")),
        }

        let rewritten = apply_header_ops(headers, &ops);
        let message = assemble_message(&rewritten, &body);

        match self.relay(&mail_from, rcpt_to, &message).await {
            Ok(()) => "250 2.6.0 Message accepted".to_string(),
            Err(e) => {
                warn!("relay failed: {e}");
                "451 4.3.0 Temporary delivery failure".to_string()
            }
        }
    }

    async fn relay(
        &self,
        mail_from: &str,
        rcpt_to: &[String],
        message: &[u8],
    ) -> Result<(), String> {
        let Some(downstream) = &self.downstream else {
            debug!("no downstream configured, message accepted and dropped");
            return Ok(());
        };

        let (host, port) = downstream
            .rsplit_once(':')
            .and_then(|(host, port)| port.parse::<u16>().ok().map(|port| (host.to_string(), port)))
            .unwrap_or_else(|| (downstream.clone(), 25));

        let mut client = mail_send::SmtpClientBuilder::new(host, port)
            .implicit_tls(false)
            .helo_host(self.server_name.clone())
            .timeout(std::time::Duration::from_secs(60))
            .connect_plain()
            .await
            .map_err(|e| e.to_string())?;

        client
            .send(mail_send::smtp::message::Message {
                mail_from: mail_from.into(),
                rcpt_to: rcpt_to.iter().map(|rcpt| rcpt.as_str().into()).collect(),
                body: message.into(),
            })
            .await
            .map_err(|e| e.to_string())?;

        client.quit().await.ok();
        Ok(())
    }
}

/// One reply line for an event outcome; reject/defer reasons already carry
/// their SMTP code and enhanced status.
fn reply_line(response: &EventResponse, ok: (u16, &str)) -> String {
    match (&response.code, &response.reason) {
        (ReturnCode::Reject, Some(reason)) | (ReturnCode::Tempfail, Some(reason)) => reason.clone(),
        (ReturnCode::Reject, None) => "550 5.7.0 Message rejected".to_string(),
        (ReturnCode::Tempfail, None) => "451 4.7.0 Please try again later".to_string(),
        _ => format!("{} {}", ok.0, ok.1),
    }
}

/// Writes the refusal reply when the event did not continue.
async fn respond_refusal(
    sink: &mut (impl AsyncWrite + Unpin),
    response: &EventResponse,
) -> Result<bool, TransportError> {
    if matches!(response.code, ReturnCode::Reject | ReturnCode::Tempfail) {
        let line = reply_line(response, (250, "Ok"));
        write_line(sink, &line).await?;
        return Ok(true);
    }
    Ok(false)
}

async fn write_line(
    sink: &mut (impl AsyncWrite + Unpin),
    line: &str,
) -> Result<(), TransportError> {
    trace!("sent: {line}");
    sink.write_all(format!("{line}\r\n").as_bytes())
        .await
        .map_err(TransportError::Write)
}

async fn read_line(
    reader: &mut (impl AsyncBufReadExt + Unpin),
    buffer: &mut Vec<u8>,
) -> Result<(), TransportError> {
    buffer.clear();
    let size = reader
        .take(BUFFER_SIZE as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(TransportError::Read)?;
    if size == 0 {
        return Err(TransportError::Dropped);
    }
    Ok(())
}

/// Collect the DATA payload up to the terminating `<CRLF>.<CRLF>`.
async fn read_data(
    reader: &mut (impl AsyncBufReadExt + Unpin),
    buffer: &mut Vec<u8>,
) -> Result<Vec<u8>, TransportError> {
    const DATA_END: &[u8] = b"\r\n.\r\n";

    let mut data = Vec::new();
    loop {
        read_line(reader, buffer).await?;
        data.extend_from_slice(buffer);

        if data.len() > MAX_DATA_SIZE {
            return Err(TransportError::Protocol("message too large".to_string()));
        }

        if data.ends_with(DATA_END) || data == DATA_END[2..] {
            data.truncate(data.len().saturating_sub(DATA_END.len()));
            return Ok(data);
        }
    }
}

/// Split a received message into unfolded headers and body.
fn split_message(data: &[u8]) -> (Vec<(String, String)>, Vec<u8>) {
    let boundary = data
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| (position, position + 4))
        .or_else(|| {
            data.windows(2)
                .position(|window| window == b"\n\n")
                .map(|position| (position, position + 2))
        });

    let (header_block, body) = match boundary {
        Some((end, start)) => (&data[..end], data[start..].to_vec()),
        None => (data, Vec::new()),
    };

    let text = String::from_utf8_lossy(header_block);
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            // folded continuation
            let (_, value) = headers.last_mut().expect("checked non-empty");
            value.push_str("\r\n");
            value.push_str(line);
            continue;
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim_end().to_string(), value.trim_start().to_string()));
            }
            None => headers.push((line.to_string(), String::new())),
        }
    }

    (headers, body)
}

/// Apply the pipeline's queued mutations to the header list.
fn apply_header_ops(
    mut headers: Vec<(String, String)>,
    ops: &[HeaderOp],
) -> Vec<(String, String)> {
    for op in ops {
        match op {
            HeaderOp::Insert { index, name, value } => {
                let position = (*index as usize).saturating_sub(1).min(headers.len());
                headers.insert(position, (name.clone(), value.clone()));
            }
            HeaderOp::Add { name, value } => {
                headers.push((name.clone(), value.clone()));
            }
            HeaderOp::Change { name, index, value } => {
                let position = headers
                    .iter()
                    .enumerate()
                    .filter(|(_, (header_name, _))| header_name.eq_ignore_ascii_case(name))
                    .map(|(position, _)| position)
                    .nth((*index as usize).saturating_sub(1));
                if let Some(position) = position {
                    if value.is_empty() {
                        headers.remove(position);
                    } else {
                        headers[position].1 = value.clone();
                    }
                }
            }
            HeaderOp::Quarantine { .. } => {
                // The quarantine verdict is already carried by the
                // X-Disposition-Quarantine header.
            }
        }
    }
    headers
}

fn assemble_message(headers: &[(String, String)], body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + 512);
    for (name, value) in headers {
        message.extend_from_slice(name.as_bytes());
        message.extend_from_slice(b": ");
        message.extend_from_slice(value.as_bytes());
        message.extend_from_slice(b"\r\n");
    }
    message.extend_from_slice(b"\r\n");
    message.extend_from_slice(body);
    message
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_splitting_and_unfolding() {
        let data = b"From: alice@example.com\r\nSubject: Hi\r\n there\r\n\r\nBody text\r\n";
        let (headers, body) = split_message(data);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
        assert_eq!(headers[1].0, "Subject");
        assert!(headers[1].1.contains("there"));
        assert_eq!(body, b"Body text\r\n");
    }

    #[test]
    fn header_ops_are_applied_in_order() {
        let headers = vec![
            ("Received".to_string(), "by mx".to_string()),
            ("From".to_string(), "alice@example.com".to_string()),
            ("Authentication-Results".to_string(), "forged".to_string()),
        ];

        let ops = vec![
            HeaderOp::Insert {
                index: 1,
                name: "Authentication-Results".to_string(),
                value: "mx.example.com;\n    none".to_string(),
            },
            HeaderOp::Add {
                name: "X-Authentication-Milter".to_string(),
                value: "Header added by Authentication Milter".to_string(),
            },
            HeaderOp::Change {
                name: "Authentication-Results".to_string(),
                index: 2,
                value: String::new(),
            },
        ];

        let rewritten = apply_header_ops(headers, &ops);
        assert_eq!(rewritten[0].0, "Authentication-Results");
        assert_eq!(rewritten[0].1, "mx.example.com;\n    none");
        assert_eq!(rewritten.last().unwrap().0, "X-Authentication-Milter");
        // the forged Authentication-Results (second occurrence after the
        // insert) is gone
        assert_eq!(
            rewritten
                .iter()
                .filter(|(name, _)| name == "Authentication-Results")
                .count(),
            1
        );
    }

    #[test]
    fn no_body_message() {
        let (headers, body) = split_message(b"From: a@b.c");
        assert_eq!(headers.len(), 1);
        assert!(body.is_empty());
    }
}
