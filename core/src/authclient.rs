/*
 * authclient.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a multi-tenant email server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Identity endpoint client: one HTTP/1.1 POST with a JSON credential body
//! per verification. Status 200 means accept, anything else reject. The
//! endpoint owns passwords; this server never stores them.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::net::connect_client_tls;

#[derive(Serialize)]
struct AuthRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Split-out pieces of the endpoint URL.
#[derive(Debug, PartialEq, Eq)]
struct ParsedUrl {
    tls: bool,
    host: String,
    port: u16,
    path: String,
}

fn parse_url(url: &str) -> Option<ParsedUrl> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return None;
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rfind(':') {
        Some(i) => (
            authority[..i].to_string(),
            authority[i + 1..].parse().ok()?,
        ),
        None => (
            authority.to_string(),
            if tls { 443 } else { 80 },
        ),
    };
    if host.is_empty() {
        return None;
    }
    Some(ParsedUrl {
        tls,
        host,
        port,
        path,
    })
}

/// Verifier backed by the external identity endpoint.
pub struct AuthClient {
    url: String,
    insecure: bool,
}

impl AuthClient {
    pub fn new(url: impl Into<String>, insecure: bool) -> Self {
        Self {
            url: url.into(),
            insecure,
        }
    }

    /// True when the endpoint accepted the credentials. Transport errors
    /// are reported as errors, not as rejection.
    pub async fn verify(&self, email: &str, password: &str) -> io::Result<bool> {
        let url = parse_url(&self.url).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "bad identity endpoint URL")
        })?;
        let body = serde_json::to_vec(&AuthRequest { email, password })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\n\
Content-Length: {}\r\nConnection: close\r\n\r\n",
            url.path,
            url.host,
            body.len()
        );

        let status = if url.tls {
            let mut stream = connect_client_tls(&url.host, url.port, self.insecure).await?;
            exchange(&mut stream, request.as_bytes(), &body).await?
        } else {
            let mut stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
            exchange(&mut stream, request.as_bytes(), &body).await?
        };
        log::debug!("identity endpoint answered {} for {}", status, email);
        Ok(status == 200)
    }
}

/// Send the request and read the status line of the response.
async fn exchange<S>(stream: &mut S, head: &[u8], body: &[u8]) -> io::Result<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(head).await?;
    stream.write_all(body).await?;
    stream.flush().await?;

    let mut line = Vec::new();
    loop {
        let mut b = [0u8; 1];
        let n = stream.read(&mut b).await?;
        if n == 0 {
            break;
        }
        if b[0] == b'\n' {
            break;
        }
        if b[0] != b'\r' {
            line.push(b[0]);
        }
    }
    let text = String::from_utf8_lossy(&line);
    // "HTTP/1.1 200 OK"
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_url("https://id.example.com/api/login"),
            Some(ParsedUrl {
                tls: true,
                host: "id.example.com".to_string(),
                port: 443,
                path: "/api/login".to_string(),
            })
        );
        assert_eq!(
            parse_url("http://127.0.0.1:8080/login"),
            Some(ParsedUrl {
                tls: false,
                host: "127.0.0.1".to_string(),
                port: 8080,
                path: "/login".to_string(),
            })
        );
        assert_eq!(parse_url("http://host"), Some(ParsedUrl {
            tls: false,
            host: "host".to_string(),
            port: 80,
            path: "/".to_string(),
        }));
        assert!(parse_url("ftp://x/").is_none());
    }

    #[tokio::test]
    async fn exchange_parses_status() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });
        let status = exchange(&mut client, b"POST / HTTP/1.1\r\n\r\n", b"{}")
            .await
            .unwrap();
        assert_eq!(status, 403);
        task.await.unwrap();
    }
}
