//! PROXY protocol (v1/v2) support
//!
//! Parses the HAProxy PROXY protocol header that may precede the MQTT
//! connection when the broker sits behind a load balancer. The header
//! carries the real client address so ACL/logging see the original peer
//! instead of the balancer's.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ppp::v1::Addresses as V1Addresses;
use ppp::v2::Addresses as V2Addresses;
use ppp::HeaderResult;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout as tokio_timeout;

/// Information recovered from a PROXY protocol header.
#[derive(Debug, Clone, Copy)]
pub struct ProxyInfo {
    /// Real client address as reported by the proxy
    pub source: SocketAddr,
    /// Address the proxy itself received the connection on
    pub destination: SocketAddr,
}

/// Maximum bytes read while hunting for a PROXY header before giving up.
/// A v2 header is at most 16 bytes of signature/fixed fields plus up to
/// 65535 bytes of TLVs in theory, but MQTT proxies never send TLVs this
/// large; 4096 is generous headroom.
const MAX_HEADER_BYTES: usize = 4096;

/// Read and parse a PROXY protocol header from the front of `stream`.
///
/// Bytes are consumed one at a time because the underlying parser only
/// tells us a header is complete once it successfully parses, and we must
/// not read past the header into the client's CONNECT packet.
pub async fn read_proxy_header<S>(
    stream: &mut S,
    read_timeout: Duration,
) -> std::io::Result<ProxyInfo>
where
    S: AsyncRead + Unpin,
{
    tokio_timeout(read_timeout, read_header(stream))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "PROXY header read timed out"))?
}

async fn read_header<S>(stream: &mut S) -> std::io::Result<ProxyInfo>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);

        match HeaderResult::parse(&buf) {
            HeaderResult::V1(Ok(header)) => return addresses_from_v1(&header.addresses),
            HeaderResult::V2(Ok(header)) => return addresses_from_v2(&header.addresses),
            HeaderResult::V1(Err(_)) | HeaderResult::V2(Err(_)) => {
                if buf.len() >= MAX_HEADER_BYTES {
                    return Err(invalid_header("PROXY header exceeded maximum size"));
                }
                // Not enough bytes yet for either format; keep reading.
                continue;
            }
        }
    }
}

fn addresses_from_v1(addresses: &V1Addresses) -> std::io::Result<ProxyInfo> {
    match *addresses {
        V1Addresses::Tcp4(ppp::v1::IPv4 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        }) => Ok(ProxyInfo {
            source: SocketAddr::new(IpAddr::V4(source_address), source_port),
            destination: SocketAddr::new(IpAddr::V4(destination_address), destination_port),
        }),
        V1Addresses::Tcp6(ppp::v1::IPv6 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        }) => Ok(ProxyInfo {
            source: SocketAddr::new(IpAddr::V6(source_address), source_port),
            destination: SocketAddr::new(IpAddr::V6(destination_address), destination_port),
        }),
        V1Addresses::Unknown => Err(invalid_header("PROXY v1 header carries no address (UNKNOWN)")),
    }
}

fn addresses_from_v2(addresses: &V2Addresses) -> std::io::Result<ProxyInfo> {
    match *addresses {
        V2Addresses::IPv4(ppp::v2::IPv4 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        }) => Ok(ProxyInfo {
            source: SocketAddr::new(IpAddr::V4(source_address), source_port),
            destination: SocketAddr::new(IpAddr::V4(destination_address), destination_port),
        }),
        V2Addresses::IPv6(ppp::v2::IPv6 {
            source_address,
            source_port,
            destination_address,
            destination_port,
        }) => Ok(ProxyInfo {
            source: SocketAddr::new(IpAddr::V6(source_address), source_port),
            destination: SocketAddr::new(IpAddr::V6(destination_address), destination_port),
        }),
        _ => Err(invalid_header("PROXY v2 header carries no routable address")),
    }
}

fn invalid_header(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}
