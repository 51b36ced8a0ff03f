//! SOCKS wire protocol (versions 4, 4a and 5)
//!
//! Only CONNECT is supported. SOCKS5 accepts the NO AUTH method and IPv4,
//! IPv6 and domain targets; SOCKS4a domains arrive via the 0.0.0.x
//! convention. Protocol failures answer with the proper rejection before
//! the connection is closed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS protocol version of one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

impl SocksVersion {
    pub fn from_rule(version: u8) -> Option<Self> {
        match version {
            4 => Some(SocksVersion::V4),
            5 => Some(SocksVersion::V5),
            _ => None,
        }
    }
}

mod v5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
}

mod v4 {
    pub const VERSION: u8 = 0x04;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const REPLY_GRANTED: u8 = 0x5A;
    pub const REPLY_REJECTED: u8 = 0x5B;
    /// Bounded read for the null-terminated user id / domain fields.
    pub const MAX_STRING: usize = 256;
}

/// SOCKS5 reply codes (RFC 1928 §6). SOCKS4 collapses everything
/// non-success to 0x5B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    Success,
    GeneralFailure,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl SocksReply {
    fn code(self) -> u8 {
        match self {
            SocksReply::Success => 0x00,
            SocksReply::GeneralFailure => 0x01,
            SocksReply::NetworkUnreachable => 0x03,
            SocksReply::HostUnreachable => 0x04,
            SocksReply::ConnectionRefused => 0x05,
            SocksReply::CommandNotSupported => 0x07,
            SocksReply::AddressTypeNotSupported => 0x08,
        }
    }
}

/// A parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub host: String,
    pub port: u16,
}

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("unsupported socks version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("client offered no acceptable auth method")]
    NoAcceptableAuth,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("io error during negotiation: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the handshake for `version` up to (and excluding) the final reply.
///
/// Rejections are written to the stream before the error returns; the
/// caller sends the success (or failure) reply once the upstream channel
/// is resolved, via [`reply_success`] / [`reply_error`].
pub async fn negotiate<S>(stream: &mut S, version: SocksVersion) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    match version {
        SocksVersion::V5 => negotiate_v5(stream).await,
        SocksVersion::V4 => negotiate_v4(stream).await,
    }
}

async fn negotiate_v5<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != v5::VERSION {
        return Err(SocksError::UnsupportedVersion(head[0]));
    }
    let nmethods = head[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&v5::AUTH_NONE) {
        stream
            .write_all(&[v5::VERSION, v5::AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[v5::VERSION, v5::AUTH_NONE]).await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != v5::VERSION {
        return Err(SocksError::Malformed("bad version in request"));
    }
    if request[1] != v5::CMD_CONNECT {
        send_v5_reply(stream, SocksReply::CommandNotSupported, None).await?;
        return Err(SocksError::UnsupportedCommand(request[1]));
    }

    let host = match request[3] {
        v5::ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        v5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| SocksError::Malformed("domain is not utf-8"))?
        }
        v5::ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_v5_reply(stream, SocksReply::AddressTypeNotSupported, None).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    debug!("socks5 connect request for {}:{}", host, port);
    Ok(SocksRequest { host, port })
}

async fn negotiate_v4<S>(stream: &mut S) -> Result<SocksRequest, SocksError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // VER CMD DSTPORT DSTIP USERID NUL [DOMAIN NUL]
    let mut head = [0u8; 8];
    stream.read_exact(&mut head).await?;
    if head[0] != v4::VERSION {
        return Err(SocksError::UnsupportedVersion(head[0]));
    }

    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = [head[4], head[5], head[6], head[7]];

    // The user id is read regardless of command so a rejection leaves the
    // stream at a clean boundary.
    read_null_terminated(stream).await?;

    if head[1] != v4::CMD_CONNECT {
        send_v4_reply(stream, v4::REPLY_REJECTED, port, ip).await?;
        return Err(SocksError::UnsupportedCommand(head[1]));
    }

    // 0.0.0.x with x != 0 means a domain string follows (SOCKS4a).
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let domain = read_null_terminated(stream).await?;
        String::from_utf8(domain).map_err(|_| SocksError::Malformed("domain is not utf-8"))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    debug!("socks4 connect request for {}:{}", host, port);
    Ok(SocksRequest { host, port })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Send + Unpin,
{
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() >= v4::MAX_STRING {
            return Err(SocksError::Malformed("unterminated string field"));
        }
        out.push(byte[0]);
    }
}

/// Report the established connection back to the client.
pub async fn reply_success<S>(
    stream: &mut S,
    version: SocksVersion,
    bound: SocketAddr,
) -> std::io::Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    match version {
        SocksVersion::V5 => send_v5_reply(stream, SocksReply::Success, Some(bound)).await,
        SocksVersion::V4 => {
            send_v4_reply(stream, v4::REPLY_GRANTED, bound.port(), v4_ip(bound)).await
        }
    }
}

/// Report a failure and leave the stream to be closed.
pub async fn reply_error<S>(
    stream: &mut S,
    version: SocksVersion,
    reply: SocksReply,
) -> std::io::Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    match version {
        SocksVersion::V5 => send_v5_reply(stream, reply, None).await,
        SocksVersion::V4 => send_v4_reply(stream, v4::REPLY_REJECTED, 0, [0, 0, 0, 0]).await,
    }
}

async fn send_v5_reply<S>(
    stream: &mut S,
    reply: SocksReply,
    bound: Option<SocketAddr>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    // VER REP RSV ATYP BND.ADDR BND.PORT
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[v5::VERSION, reply.code(), 0x00]);
    match bound {
        Some(SocketAddr::V4(addr)) => {
            out.push(v5::ATYP_IPV4);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V6(addr)) => {
            out.push(v5::ATYP_IPV6);
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            out.push(v5::ATYP_IPV4);
            out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&out).await
}

async fn send_v4_reply<S>(
    stream: &mut S,
    reply: u8,
    port: u16,
    ip: [u8; 4],
) -> std::io::Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    // VN REP DSTPORT DSTIP
    let mut out = [0u8; 8];
    out[1] = reply;
    out[2..4].copy_from_slice(&port.to_be_bytes());
    out[4..8].copy_from_slice(&ip);
    stream.write_all(&out).await
}

fn v4_ip(addr: SocketAddr) -> [u8; 4] {
    match addr.ip() {
        IpAddr::V4(ip) => ip.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn drive_v5(client_bytes: &[u8]) -> (Result<SocksRequest, SocksError>, Vec<u8>) {
        let (mut client, mut server) = duplex(512);
        client.write_all(client_bytes).await.unwrap();
        client.shutdown().await.unwrap();

        let result = negotiate_v5(&mut server).await;
        drop(server);
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        (result, echoed)
    }

    #[tokio::test]
    async fn socks5_connect_ipv4() {
        let mut bytes = vec![0x05, 0x01, 0x00]; // greeting, one method: none
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7, 0x1F, 0x90]);
        let (result, echoed) = drive_v5(&bytes).await;

        let request = result.unwrap();
        assert_eq!(request.host, "10.0.0.7");
        assert_eq!(request.port, 8080);
        assert_eq!(echoed, vec![0x05, 0x00]); // method selection only
    }

    #[tokio::test]
    async fn socks5_connect_domain() {
        let mut bytes = vec![0x05, 0x02, 0x00, 0x02]; // two methods offered
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]);
        bytes.push(16);
        bytes.extend_from_slice(b"httpbin.internal");
        bytes.extend_from_slice(&80u16.to_be_bytes());
        let (result, _) = drive_v5(&bytes).await;

        let request = result.unwrap();
        assert_eq!(request.host, "httpbin.internal");
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn socks5_connect_ipv6() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let (result, _) = drive_v5(&bytes).await;

        let request = result.unwrap();
        assert_eq!(request.host, "::1");
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn socks5_rejects_auth_requiring_clients() {
        // Client only offers username/password (0x02).
        let (result, echoed) = drive_v5(&[0x05, 0x01, 0x02]).await;
        assert!(matches!(result, Err(SocksError::NoAcceptableAuth)));
        assert_eq!(echoed, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn socks5_rejects_bind_command() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50]);
        let (result, echoed) = drive_v5(&bytes).await;

        assert!(matches!(result, Err(SocksError::UnsupportedCommand(0x02))));
        // method selection + reply with code 0x07
        assert_eq!(echoed[0..2], [0x05, 0x00]);
        assert_eq!(echoed[2], 0x05);
        assert_eq!(echoed[3], 0x07);
    }

    #[tokio::test]
    async fn socks5_rejects_unknown_address_type() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x09]);
        let (result, echoed) = drive_v5(&bytes).await;

        assert!(matches!(result, Err(SocksError::UnsupportedAddressType(0x09))));
        assert_eq!(echoed[3], 0x08);
    }

    #[tokio::test]
    async fn socks5_success_reply_carries_bound_address() {
        let (mut client, mut server) = duplex(128);
        let bound: SocketAddr = "127.0.0.1:11080".parse().unwrap();
        reply_success(&mut server, SocksVersion::V5, bound)
            .await
            .unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);
        assert_eq!(reply[4..8], [127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 11080);
    }

    #[tokio::test]
    async fn socks4_connect_plain_ip() {
        let (mut client, mut server) = duplex(128);
        let mut bytes = vec![0x04, 0x01];
        bytes.extend_from_slice(&3000u16.to_be_bytes());
        bytes.extend_from_slice(&[192, 168, 1, 10]);
        bytes.extend_from_slice(b"alice\0");
        client.write_all(&bytes).await.unwrap();

        let request = negotiate_v4(&mut server).await.unwrap();
        assert_eq!(request.host, "192.168.1.10");
        assert_eq!(request.port, 3000);
    }

    #[tokio::test]
    async fn socks4a_domain_convention() {
        let (mut client, mut server) = duplex(128);
        let mut bytes = vec![0x04, 0x01];
        bytes.extend_from_slice(&80u16.to_be_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 1]); // 0.0.0.x marker
        bytes.extend_from_slice(b"\0"); // empty user id
        bytes.extend_from_slice(b"example.internal\0");
        client.write_all(&bytes).await.unwrap();

        let request = negotiate_v4(&mut server).await.unwrap();
        assert_eq!(request.host, "example.internal");
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn socks4_rejects_bind() {
        let (mut client, mut server) = duplex(128);
        let mut bytes = vec![0x04, 0x02]; // BIND
        bytes.extend_from_slice(&3000u16.to_be_bytes());
        bytes.extend_from_slice(&[192, 168, 1, 10]);
        bytes.extend_from_slice(b"\0");
        client.write_all(&bytes).await.unwrap();
        client.shutdown().await.unwrap();

        let result = negotiate_v4(&mut server).await;
        assert!(matches!(result, Err(SocksError::UnsupportedCommand(0x02))));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);
    }

    #[tokio::test]
    async fn socks4_success_reply_format() {
        let (mut client, mut server) = duplex(128);
        let bound: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        reply_success(&mut server, SocksVersion::V4, bound)
            .await
            .unwrap();
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x00);
        assert_eq!(reply[1], 0x5A);
    }

    #[test]
    fn version_from_rule() {
        assert_eq!(SocksVersion::from_rule(4), Some(SocksVersion::V4));
        assert_eq!(SocksVersion::from_rule(5), Some(SocksVersion::V5));
        assert_eq!(SocksVersion::from_rule(6), None);
    }
}
