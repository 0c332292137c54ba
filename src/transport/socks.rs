//! SOCKS5 client (RFC 1928, RFC 1929 username/password).
//!
//! Only the CONNECT command is used. The handshake runs over an already
//! connected proxy stream and leaves it tunnelled to the target.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::ProxyConfig;
use crate::error::{ProtocolError, Result};
use crate::transport::tcp;

const SOCKS_VER: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPT: u8 = 0xFF;
const USERPASS_VER: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;

/// Connect to `target_host:target_port` through the proxy
#[instrument(skip(proxy), fields(proxy = %proxy.host, proxy_port = proxy.port))]
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    buffer_size: usize,
    timeout: Duration,
) -> Result<TcpStream> {
    let proxy_addr = tcp::resolve(&format!("{}:{}", proxy.host, proxy.port)).await?;
    let mut stream = tcp::connect(proxy_addr, buffer_size, timeout).await?;
    tokio::time::timeout(
        timeout,
        handshake(&mut stream, proxy, target_host, target_port),
    )
    .await
    .map_err(|_| ProtocolError::Timeout)??;
    debug!(target_host, target_port, "SOCKS5 tunnel established");
    Ok(stream)
}

/// Run the SOCKS5 negotiation and CONNECT request on `stream`
pub async fn handshake<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let credentials = match (&proxy.username, &proxy.password) {
        (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
        _ => None,
    };

    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS_VER, 2, METHOD_NO_AUTH, METHOD_USERPASS]
    } else {
        &[SOCKS_VER, 1, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VER {
        return Err(ProtocolError::ProxyError(format!(
            "invalid socks version {}",
            choice[0]
        )));
    }

    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USERPASS, Some((user, pass))) => authenticate(stream, user, pass).await?,
        (METHOD_NO_ACCEPT, _) | (METHOD_USERPASS, None) => {
            return Err(ProtocolError::ProxyError(
                "no acceptable auth methods".into(),
            ))
        }
        (other, _) => {
            return Err(ProtocolError::ProxyError(format!(
                "unexpected auth method {other}"
            )))
        }
    }

    let mut request = vec![SOCKS_VER, CMD_CONNECT, 0x00];
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let host = target_host.as_bytes();
            let len = u8::try_from(host.len())
                .map_err(|_| ProtocolError::ProxyError("target host name too long".into()))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host);
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VER {
        return Err(ProtocolError::ProxyError(format!(
            "invalid socks version {}",
            reply[0]
        )));
    }
    if reply[1] != REP_SUCCEEDED {
        return Err(ProtocolError::ProxyError(format!(
            "proxy refused connect (reply {})",
            reply[1]
        )));
    }

    // bound address is unused
    let skip = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        atyp => {
            return Err(ProtocolError::ProxyError(format!(
                "unsupported address type {atyp}"
            )))
        }
    };
    let mut bound = vec![0u8; skip + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(user.len())
        .map_err(|_| ProtocolError::ProxyError("proxy username too long".into()))?;
    let plen = u8::try_from(pass.len())
        .map_err(|_| ProtocolError::ProxyError("proxy password too long".into()))?;

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(USERPASS_VER);
    request.push(ulen);
    request.extend_from_slice(user.as_bytes());
    request.push(plen);
    request.extend_from_slice(pass.as_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(ProtocolError::ProxyError("authentication failed".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_no_auth_domain_request() {
        let (mut client, mut server) = duplex(256);
        let proxy = ProxyConfig::new("proxy", 1080);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS_VER, 1, METHOD_NO_AUTH]);
            server
                .write_all(&[SOCKS_VER, METHOD_NO_AUTH])
                .await
                .unwrap();

            let mut head = [0u8; 5];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[SOCKS_VER, CMD_CONNECT, 0, ATYP_DOMAIN]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            server.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"example.org");
            assert_eq!(&rest[head[4] as usize..], &443u16.to_be_bytes());

            server
                .write_all(&[SOCKS_VER, REP_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let result = handshake(&mut client, &proxy, "example.org", 443).await;
        assert!(result.is_ok());
        assert!(server_task.await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (mut client, mut server) = duplex(256);
        let proxy = ProxyConfig::new("proxy", 1080).with_credentials("user", "wrong");

        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[SOCKS_VER, METHOD_USERPASS])
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let _ = server.read(&mut buf).await;
            server.write_all(&[USERPASS_VER, 0x01]).await.unwrap();
        });

        let result = handshake(&mut client, &proxy, "10.0.0.1", 9000).await;
        assert!(matches!(result, Err(ProtocolError::ProxyError(_))));
    }
}
