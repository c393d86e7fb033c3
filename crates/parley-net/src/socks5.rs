//! Minimal SOCKS5 client (RFC 1928): no authentication, CONNECT to a domain
//! name. XEP-0065 uses the destination hash as that domain name.

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a TCP connection to the proxy at `addr` and CONNECT through it.
pub async fn connect(addr: &str, dst_host: &str, dst_port: u16) -> anyhow::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to SOCKS5 proxy {}", addr))?;
    handshake(&mut stream, dst_host, dst_port).await?;
    debug!(proxy = addr, "SOCKS5 connection established");
    Ok(stream)
}

/// Run the client side of the SOCKS5 negotiation on an open stream.
pub async fn handshake<S>(stream: &mut S, dst_host: &str, dst_port: u16) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if dst_host.len() > u8::MAX as usize {
        bail!("SOCKS5 destination too long: {} bytes", dst_host.len());
    }

    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .context("reading SOCKS5 method selection")?;
    if choice[0] != VERSION || choice[1] != NO_AUTH {
        bail!("SOCKS5 proxy refused no-auth method: {:?}", choice);
    }

    let mut request = Vec::with_capacity(7 + dst_host.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, dst_host.len() as u8]);
    request.extend_from_slice(dst_host.as_bytes());
    request.extend_from_slice(&dst_port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .context("reading SOCKS5 reply")?;
    if head[0] != VERSION {
        bail!("unexpected SOCKS version in reply: {}", head[0]);
    }
    if head[1] != 0x00 {
        bail!("SOCKS5 CONNECT failed with code {}", head[1]);
    }

    // Bound address and port; read and discard.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => bail!("unknown SOCKS5 address type {}", other),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;
    Ok(())
}
