// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt::Display, sync::Arc};

use crate::{ConnectionContext, RtspMessageContext};
use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// Currently the focus is on providing detailed human-readable error messages.
/// In most cases they have enough information to find the offending message
/// in a packet capture.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<u16> {
        match self.0.as_ref() {
            ErrorInt::ResponseError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true if the error came from the transport rather than the
    /// protocol layer: a failed connect, read, or write.
    pub fn is_network(&self) -> bool {
        matches!(
            self.0.as_ref(),
            ErrorInt::ConnectError(_)
                | ErrorInt::ConnectTimeout { .. }
                | ErrorInt::ReadError { .. }
                | ErrorInt::ReadTimeout { .. }
                | ErrorInt::WriteError { .. }
                | ErrorInt::ShortWrite { .. }
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    /// The method's caller provided an invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unable to connect to RTSP server: {0}")]
    ConnectError(#[source] std::io::Error),

    #[error("Connect to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    #[error("Error reading from RTSP peer: {source}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    ReadError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        source: std::io::Error,
    },

    #[error("Read timed out\n\nconn: {conn_ctx}")]
    ReadTimeout { conn_ctx: ConnectionContext },

    #[error("Error writing to RTSP peer: {source}\n\nconn: {conn_ctx}")]
    WriteError {
        conn_ctx: ConnectionContext,
        source: std::io::Error,
    },

    #[error(
        "Data partially written to RTSP peer: {wrote} of {expected} bytes\n\nconn: {conn_ctx}"
    )]
    ShortWrite {
        conn_ctx: ConnectionContext,
        wrote: usize,
        expected: usize,
    },

    /// Unparseable or unexpected RTSP message.
    #[error("RTSP framing error: {description}\n\nconn: {conn_ctx}\nmsg: {msg_ctx}")]
    FramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error(
        "{status} response to {method} CSeq={cseq}: {description}\n\n\
         conn: {conn_ctx}\nmsg: {msg_ctx}"
    )]
    ResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        method: String,
        cseq: u32,
        status: u16,
        description: String,
    },

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Timeout")]
    Timeout,
}
