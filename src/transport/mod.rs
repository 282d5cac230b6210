//! North-side transports.
//!
//! Both front-ends parse their own wire protocol and drive the pipeline's
//! `top_*` entrypoints; the pipeline never touches wire bytes. The milter
//! codec answers the MTA directly; the SMTP proxy applies the queued header
//! mutations itself and relays accepted mail downstream.

use thiserror::Error;

pub mod milter;
pub mod smtp;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to read from peer: {0}")]
    Read(std::io::Error),
    #[error("failed to write to peer: {0}")]
    Write(std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection dropped unexpectedly")]
    Dropped,
}
