//! One request, one connection: write the request line, read until the boss
//! closes.

use core::{net::SocketAddr, time::Duration};

use nodeagent_common::Request;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    time::timeout,
};
use tracing::trace;

use crate::error::{ProtocolError, TransportError};

/// Responses larger than this are rejected by [`lines`].
pub const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;

/// Send `request` to `addr` and return the raw response.
///
/// The whole exchange, connecting included, is bounded by `limit`.
///
/// # Errors
///
/// Returns a [`TransportError`] if the exchange fails or times out.
pub async fn exchange(
    addr: SocketAddr,
    request: &Request,
    limit: Duration,
) -> Result<Vec<u8>, TransportError> {
    let command = request.command().to_owned();
    let io = |source| TransportError::Io {
        command: command.clone(),
        source,
    };

    let exchange = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.write_all(&request.encode()).await.map_err(io)?;
        stream.flush().await.map_err(io)?;

        // One byte past the limit tells an oversized response from a full one.
        let mut response = Vec::new();
        stream
            .take(MAX_RESPONSE_BYTES + 1)
            .read_to_end(&mut response)
            .await
            .map_err(io)?;
        Ok(response)
    };

    let response = timeout(limit, exchange)
        .await
        .map_err(|_| TransportError::Timeout {
            addr: addr.to_string(),
            command: command.clone(),
        })??;
    trace!(%addr, %command, bytes = response.len(), "Received response");
    Ok(response)
}

/// Split a response into trimmed, non-empty lines.
///
/// # Errors
///
/// Returns [`ProtocolError::TooLarge`] if the response went past
/// [`MAX_RESPONSE_BYTES`], or [`ProtocolError::InvalidUtf8`] if it is not UTF-8.
pub fn lines(command: &str, response: &[u8]) -> Result<Vec<String>, ProtocolError> {
    lines_within(command, response, MAX_RESPONSE_BYTES)
}

fn lines_within(command: &str, response: &[u8], limit: u64) -> Result<Vec<String>, ProtocolError> {
    if !u64::try_from(response.len()).is_ok_and(|len| len <= limit) {
        return Err(ProtocolError::TooLarge {
            command: command.to_owned(),
            limit,
        });
    }
    let text = core::str::from_utf8(response).map_err(|_| ProtocolError::InvalidUtf8 {
        command: command.to_owned(),
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}
