//! PROXY protocol v1 and v2 headers
//!
//! Listeners with the `proxy_protocol` listener filter read the header
//! before anything else and treat its source address as the downstream
//! remote address.

use crate::error::ProxyError;
use crate::Result;
use ppp::v2::Command;
use ppp::{v1, v2, HeaderResult, PartialResult};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Largest header we wait for: v2 fixed part plus addresses and a small TLV budget
const MAX_HEADER_LEN: usize = 16 + 536;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: u8,
    /// `None` for `UNKNOWN` and `LOCAL` headers
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

impl From<&v1::Addresses> for ProxyHeader {
    fn from(addresses: &v1::Addresses) -> Self {
        let (source, destination) = match addresses {
            v1::Addresses::Tcp4(a) => (
                Some(SocketAddr::new(a.source_address.into(), a.source_port)),
                Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            ),
            v1::Addresses::Tcp6(a) => (
                Some(SocketAddr::new(a.source_address.into(), a.source_port)),
                Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            ),
            v1::Addresses::Unknown => (None, None),
        };
        ProxyHeader {
            version: 1,
            source,
            destination,
        }
    }
}

impl From<&v2::Header<'_>> for ProxyHeader {
    fn from(header: &v2::Header<'_>) -> Self {
        let local = ProxyHeader {
            version: 2,
            source: None,
            destination: None,
        };
        // LOCAL: health checks from the proxy itself
        if header.command == Command::Local {
            return local;
        }
        match &header.addresses {
            v2::Addresses::IPv4(a) => ProxyHeader {
                version: 2,
                source: Some(SocketAddr::new(a.source_address.into(), a.source_port)),
                destination: Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            },
            v2::Addresses::IPv6(a) => ProxyHeader {
                version: 2,
                source: Some(SocketAddr::new(a.source_address.into(), a.source_port)),
                destination: Some(SocketAddr::new(a.destination_address.into(), a.destination_port)),
            },
            // unix sockets and unspecified families carry no usable address
            _ => local,
        }
    }
}

/// Parse a header at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, or the header and its
/// length in bytes.
pub fn parse(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>> {
    let result = HeaderResult::parse(buf);
    if result.is_incomplete() {
        return Ok(None);
    }
    match result {
        HeaderResult::V1(Ok(header)) => Ok(Some((ProxyHeader::from(&header.addresses), header.header.len()))),
        HeaderResult::V2(Ok(header)) => Ok(Some((ProxyHeader::from(&header), header.header.len()))),
        HeaderResult::V1(Err(e)) => Err(ProxyError::ProxyProtocol(format!("invalid v1 header: {}", e))),
        HeaderResult::V2(Err(e)) => Err(ProxyError::ProxyProtocol(format!("invalid v2 header: {}", e))),
    }
}

/// Read a PROXY header off a new connection.
///
/// With `optional` set, a connection that does not start with a header is
/// left untouched and `None` is returned.
pub async fn read_proxy_header(stream: &mut TcpStream, optional: bool) -> Result<Option<ProxyHeader>> {
    let mut buf = vec![0u8; MAX_HEADER_LEN];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::ProxyProtocol("connection closed before header".into()));
        }
        if n == seen {
            // peek returns immediately while data is buffered
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            continue;
        }
        seen = n;
        match parse(&buf[..n]) {
            Ok(Some((header, len))) => {
                let mut consumed = vec![0u8; len];
                stream.read_exact(&mut consumed).await?;
                return Ok(Some(header));
            }
            Ok(None) if n >= MAX_HEADER_LEN => {
                return Err(ProxyError::ProxyProtocol("header too long".into()))
            }
            Ok(None) => continue,
            Err(_) if optional => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}
