//! Outbound peer connections through a SOCKS5 or HTTP proxy.
use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl FromStr for ProxyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" => Ok(Self::Socks5),
            "http" => Ok(Self::Http),
            _ => Err(Error::ProxyInvalid(format!("unknown proxy kind {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Build a proxy configuration, validating the input.
    ///
    /// Credentials are only supported by SOCKS5, and must fit in the 255
    /// bytes allowed by the username/password authentication.
    pub fn new(
        kind: ProxyKind,
        host: &str,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, Error> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::ProxyInvalid("empty host".into()));
        }
        if port == 0 {
            return Err(Error::ProxyInvalid("port must not be 0".into()));
        }
        if username.is_some() != password.is_some() {
            return Err(Error::ProxyInvalid(
                "username and password go together".into(),
            ));
        }
        if username.is_some() && kind != ProxyKind::Socks5 {
            return Err(Error::ProxyInvalid(
                "credentials are only supported for socks5".into(),
            ));
        }
        let too_long = |v: &Option<String>| {
            v.as_ref().is_some_and(|v| v.is_empty() || v.len() > 255)
        };
        if too_long(&username) || too_long(&password) {
            return Err(Error::ProxyInvalid(
                "credentials must have between 1 and 255 bytes".into(),
            ));
        }
        Ok(Self { kind, host: host.to_owned(), port, username, password })
    }

    /// Open a TCP tunnel to `target` through the proxy.
    pub async fn connect(&self, target: SocketAddr) -> Result<TcpStream, Error> {
        let mut stream =
            TcpStream::connect((self.host.as_str(), self.port)).await?;
        debug!("connected to proxy {}:{}", self.host, self.port);
        match self.kind {
            ProxyKind::Socks5 => self.socks5_connect(&mut stream, target).await?,
            ProxyKind::Http => http_connect(&mut stream, target).await?,
        }
        Ok(stream)
    }

    async fn socks5_connect(
        &self,
        stream: &mut TcpStream,
        target: SocketAddr,
    ) -> Result<(), Error> {
        // greeting: version 5 and the supported auth methods
        let method = match (&self.username, &self.password) {
            (Some(_), Some(_)) => 0x02,
            _ => 0x00,
        };
        stream.write_all(&[0x05, 0x01, method]).await?;

        let mut resp = [0u8; 2];
        stream.read_exact(&mut resp).await?;
        if resp[0] != 0x05 || resp[1] != method {
            return Err(Error::ProxyFailed("socks5 auth method rejected".into()));
        }

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let mut auth = vec![0x01, user.len() as u8];
            auth.extend_from_slice(user.as_bytes());
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass.as_bytes());
            stream.write_all(&auth).await?;

            stream.read_exact(&mut resp).await?;
            if resp[1] != 0x00 {
                return Err(Error::ProxyFailed("socks5 auth failed".into()));
            }
        }

        // VER, CMD=CONNECT, RSV, ATYP, DST.ADDR, DST.PORT
        let mut req = vec![0x05, 0x01, 0x00];
        match target.ip() {
            IpAddr::V4(ip) => {
                req.push(0x01);
                req.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                req.push(0x04);
                req.extend_from_slice(&ip.octets());
            }
        }
        req.extend_from_slice(&target.port().to_be_bytes());
        stream.write_all(&req).await?;

        // VER, REP, RSV, ATYP, BND.ADDR, BND.PORT
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != 0x05 {
            return Err(Error::ProxyFailed("socks5 invalid version".into()));
        }
        if header[1] != 0x00 {
            return Err(Error::ProxyFailed(format!(
                "socks5 connect failed with status {}",
                header[1]
            )));
        }
        let bind_len = match header[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => stream.read_u8().await? as usize + 2,
            atyp => {
                return Err(Error::ProxyFailed(format!(
                    "socks5 unknown address type {atyp}"
                )))
            }
        };
        let mut bind = vec![0u8; bind_len];
        stream.read_exact(&mut bind).await?;

        Ok(())
    }
}

async fn http_connect(
    stream: &mut TcpStream,
    target: SocketAddr,
) -> Result<(), Error> {
    // SocketAddr already writes ipv6 between brackets
    let request =
        format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= 4096 {
            return Err(Error::ProxyFailed("http response too large".into()));
        }
        response.push(stream.read_u8().await?);
    }

    let response = String::from_utf8_lossy(&response);
    let status = response
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .and_then(|status| status.parse::<u16>().ok())
        .ok_or_else(|| Error::ProxyFailed("http invalid response".into()))?;

    if status != 200 {
        return Err(Error::ProxyFailed(format!(
            "http connect failed with status {status}"
        )));
    }
    Ok(())
}
