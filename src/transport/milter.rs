//! Sendmail milter protocol codec.
//!
//! Packets are a 4-byte big-endian length followed by a one-byte command and
//! its payload. The codec negotiates options, feeds macros into the symbol
//! table, dispatches events into the pipeline and answers with one action
//! per event, emitting header mutation packets before the final EOM action.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::{
    disposition::ReturnCode,
    pipeline::{EventResponse, HeaderOp, Pipeline},
    transport::TransportError,
};

// Commands (SMFIC_)
const SMFIC_OPTNEG: u8 = b'O';
const SMFIC_CONNECT: u8 = b'C';
const SMFIC_HELO: u8 = b'H';
const SMFIC_MAIL: u8 = b'M';
const SMFIC_RCPT: u8 = b'R';
const SMFIC_DATA: u8 = b'T';
const SMFIC_HEADER: u8 = b'L';
const SMFIC_EOH: u8 = b'N';
const SMFIC_BODY: u8 = b'B';
const SMFIC_BODYEOB: u8 = b'E';
const SMFIC_ABORT: u8 = b'A';
const SMFIC_QUIT: u8 = b'Q';
const SMFIC_QUIT_NC: u8 = b'K';
const SMFIC_MACRO: u8 = b'D';

// Responses (SMFIR_)
const SMFIR_CONTINUE: u8 = b'c';
const SMFIR_ACCEPT: u8 = b'a';
const SMFIR_REJECT: u8 = b'r';
const SMFIR_TEMPFAIL: u8 = b't';
const SMFIR_DISCARD: u8 = b'd';
const SMFIR_REPLYCODE: u8 = b'y';
const SMFIR_ADDHEADER: u8 = b'h';
const SMFIR_INSHEADER: u8 = b'i';
const SMFIR_CHGHEADER: u8 = b'm';
const SMFIR_QUARANTINE: u8 = b'q';

const SMFI_VERSION: u32 = 6;
// Add headers, change headers, quarantine
const ACTION_FLAGS: u32 = 0x01 | 0x02 | 0x20;

/// Largest packet we accept from the MTA; bigger means a broken peer.
const MAX_PACKET: u32 = 64 * 1024 * 1024;

pub struct MilterConnection {
    pipeline: Pipeline,
}

impl MilterConnection {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Serve one milter connection until QUIT or EOF. Returns whether the
    /// session loop should terminate instead of accepting further work.
    pub async fn handle(
        mut self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    ) -> Result<bool, TransportError> {
        self.pipeline.top_setup().await;

        loop {
            let Some((command, data)) = read_packet(stream).await? else {
                debug!("milter peer closed the connection");
                self.pipeline.top_close().await;
                break;
            };

            trace!(command = %(command as char), len = data.len(), "milter packet");

            match command {
                SMFIC_OPTNEG => {
                    let mut payload = Vec::with_capacity(12);
                    payload.extend_from_slice(&SMFI_VERSION.to_be_bytes());
                    payload.extend_from_slice(&ACTION_FLAGS.to_be_bytes());
                    payload.extend_from_slice(&0u32.to_be_bytes());
                    write_packet(stream, SMFIC_OPTNEG, &payload).await?;
                }
                SMFIC_MACRO => {
                    self.store_macros(&data);
                }
                SMFIC_CONNECT => {
                    let (hostname, ip) = parse_connect(&data)?;
                    let response = self.pipeline.top_connect(&hostname, ip).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_HELO => {
                    let helo = parse_cstring(&data);
                    let response = self.pipeline.top_helo(&helo).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_MAIL => {
                    let from = parse_cstring(&data);
                    let response = self.pipeline.top_envfrom(&from).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_RCPT => {
                    let rcpt = parse_cstring(&data);
                    let response = self.pipeline.top_envrcpt(&rcpt).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_DATA => {
                    write_packet(stream, SMFIR_CONTINUE, &[]).await?;
                }
                SMFIC_HEADER => {
                    let (name, value) = parse_header(&data)?;
                    let response = self.pipeline.top_header(&name, &value).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_EOH => {
                    let response = self.pipeline.top_eoh().await;
                    self.respond(stream, response).await?;
                }
                SMFIC_BODY => {
                    let response = self.pipeline.top_body(&data).await;
                    self.respond(stream, response).await?;
                }
                SMFIC_BODYEOB => {
                    let response = self.pipeline.top_eom().await;
                    for op in self.pipeline.take_header_ops() {
                        write_header_op(stream, &op).await?;
                    }
                    self.respond(stream, response).await?;
                }
                SMFIC_ABORT => {
                    // No response; the connection stays open for a new
                    // message.
                    self.pipeline.top_abort().await;
                }
                SMFIC_QUIT_NC => {
                    self.pipeline.top_abort().await;
                    write_packet(stream, SMFIR_CONTINUE, &[]).await?;
                }
                SMFIC_QUIT => {
                    self.pipeline.top_close().await;
                    break;
                }
                other => {
                    warn!("unknown milter command {:?}", other as char);
                    write_packet(stream, SMFIR_CONTINUE, &[]).await?;
                }
            }
        }

        Ok(self.pipeline.ctx.should_exit_on_close())
    }

    fn store_macros(&mut self, data: &[u8]) {
        let Some((&stage_cmd, rest)) = data.split_first() else {
            return;
        };
        let stage = match stage_cmd {
            SMFIC_CONNECT => 'C',
            SMFIC_HELO => 'H',
            SMFIC_MAIL => 'M',
            SMFIC_RCPT => 'R',
            _ => 'B',
        };

        let mut parts = rest
            .split(|&b| b == 0)
            .map(|part| String::from_utf8_lossy(part).into_owned());
        let mut symbols = Vec::new();
        while let (Some(name), Some(value)) = (parts.next(), parts.next()) {
            if name.is_empty() {
                continue;
            }
            symbols.push((name, value));
        }
        self.pipeline.ctx.symbols.set_all(stage, symbols);
    }

    async fn respond(
        &mut self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        response: EventResponse,
    ) -> Result<(), TransportError> {
        match (response.code, response.reason) {
            (ReturnCode::Continue, _) => write_packet(stream, SMFIR_CONTINUE, &[]).await,
            (ReturnCode::Accept, _) => write_packet(stream, SMFIR_ACCEPT, &[]).await,
            (ReturnCode::Discard, _) => write_packet(stream, SMFIR_DISCARD, &[]).await,
            (ReturnCode::Reject, Some(reason)) | (ReturnCode::Tempfail, Some(reason)) => {
                let mut payload = reason.into_bytes();
                payload.push(0);
                write_packet(stream, SMFIR_REPLYCODE, &payload).await
            }
            (ReturnCode::Reject, None) => write_packet(stream, SMFIR_REJECT, &[]).await,
            (ReturnCode::Tempfail, None) => write_packet(stream, SMFIR_TEMPFAIL, &[]).await,
        }
    }
}

async fn read_packet(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<Option<(u8, Vec<u8>)>, TransportError> {
    let mut length = [0u8; 4];
    match stream.read_exact(&mut length).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::Read(e)),
    }

    let length = u32::from_be_bytes(length);
    if length == 0 || length > MAX_PACKET {
        return Err(TransportError::Protocol(format!(
            "unreasonable packet length {length}"
        )));
    }

    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(TransportError::Read)?;

    let command = payload[0];
    payload.remove(0);
    Ok(Some((command, payload)))
}

async fn write_packet(
    stream: &mut (impl AsyncWrite + Unpin),
    command: u8,
    data: &[u8],
) -> Result<(), TransportError> {
    let mut packet = Vec::with_capacity(5 + data.len());
    packet.extend_from_slice(&((data.len() + 1) as u32).to_be_bytes());
    packet.push(command);
    packet.extend_from_slice(data);
    stream
        .write_all(&packet)
        .await
        .map_err(TransportError::Write)
}

async fn write_header_op(
    stream: &mut (impl AsyncWrite + Unpin),
    op: &HeaderOp,
) -> Result<(), TransportError> {
    match op {
        HeaderOp::Insert { index, name, value } => {
            let mut payload = index.to_be_bytes().to_vec();
            push_cstring(&mut payload, name);
            push_cstring(&mut payload, value);
            write_packet(stream, SMFIR_INSHEADER, &payload).await
        }
        HeaderOp::Add { name, value } => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, name);
            push_cstring(&mut payload, value);
            write_packet(stream, SMFIR_ADDHEADER, &payload).await
        }
        HeaderOp::Change { name, index, value } => {
            let mut payload = index.to_be_bytes().to_vec();
            push_cstring(&mut payload, name);
            push_cstring(&mut payload, value);
            write_packet(stream, SMFIR_CHGHEADER, &payload).await
        }
        HeaderOp::Quarantine { reason } => {
            let mut payload = Vec::new();
            push_cstring(&mut payload, reason);
            write_packet(stream, SMFIR_QUARANTINE, &payload).await
        }
    }
}

fn push_cstring(payload: &mut Vec<u8>, value: &str) {
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
}

fn parse_cstring(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// CONNECT payload: hostname NUL, family byte, port (2 bytes BE), address
/// string NUL. Socket families other than inet/inet6 carry no address.
fn parse_connect(data: &[u8]) -> Result<(String, Option<IpAddr>), TransportError> {
    let Some(end) = data.iter().position(|&b| b == 0) else {
        return Err(TransportError::Protocol(
            "connect packet without hostname".to_string(),
        ));
    };
    let hostname = String::from_utf8_lossy(&data[..end]).into_owned();

    let rest = &data[end + 1..];
    let ip = match rest.first() {
        Some(b'4') | Some(b'6') if rest.len() > 3 => {
            let address = parse_cstring(&rest[3..]);
            address.parse().ok()
        }
        _ => None,
    };

    Ok((hostname, ip))
}

fn parse_header(data: &[u8]) -> Result<(String, String), TransportError> {
    let mut parts = data.splitn(2, |&b| b == 0);
    let name = parts
        .next()
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .ok_or_else(|| TransportError::Protocol("header packet without name".to_string()))?;
    let value = parts
        .next()
        .map(parse_cstring)
        .unwrap_or_default();
    Ok((name, value))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connect_payload_with_inet_family() {
        let mut data = b"mail.example.com\0".to_vec();
        data.push(b'4');
        data.extend_from_slice(&25u16.to_be_bytes());
        data.extend_from_slice(b"192.0.2.10\0");

        let (hostname, ip) = parse_connect(&data).unwrap();
        assert_eq!(hostname, "mail.example.com");
        assert_eq!(ip, Some("192.0.2.10".parse().unwrap()));
    }

    #[test]
    fn connect_payload_unknown_family() {
        let data = b"localhost\0U".to_vec();
        let (hostname, ip) = parse_connect(&data).unwrap();
        assert_eq!(hostname, "localhost");
        assert_eq!(ip, None);
    }

    #[test]
    fn header_payload() {
        let (name, value) = parse_header(b"From\0alice@example.com\0").unwrap();
        assert_eq!(name, "From");
        assert_eq!(value, "alice@example.com");
    }

    #[tokio::test]
    async fn packet_round_trip() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_packet(&mut cursor, SMFIR_CONTINUE, b"data").await.unwrap();
        cursor.set_position(0);
        let (command, data) = read_packet(&mut cursor).await.unwrap().unwrap();
        assert_eq!(command, SMFIR_CONTINUE);
        assert_eq!(data, b"data");

        // EOF yields a clean end-of-stream
        assert!(read_packet(&mut cursor).await.unwrap().is_none());
    }
}
