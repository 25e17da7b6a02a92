/*
 * config.rs
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

//! Server configuration, read from a small XML file. All XML read uses the
//! quick_xml parser; no regex or hand parsing. Every field has a default so
//! a missing file yields a runnable local setup.

use std::path::PathBuf;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Where one protocol listens: TCP address and/or UNIX socket path, plus an
/// optional TLS certificate pair for STARTTLS (and implicit TLS listeners).
#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub tcp: Option<String>,
    pub socket: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub hostname: String,
    pub storage_dir: PathBuf,
    /// Identity endpoint URL; POST {"email","password"}, 200 means accept.
    pub auth_url: String,
    /// Skip TLS verification when talking to the identity endpoint.
    pub auth_insecure: bool,
    pub imap: ListenerConfig,
    pub lmtp: ListenerConfig,
    /// Accepted recipient domains; empty means accept any.
    pub allowed_domains: Vec<String>,
    pub reject_unknown_user: bool,
    /// LMTP DATA / IMAP APPEND size cap in octets.
    pub max_size: u64,
    pub max_recipients: u32,
    /// LMTP per-command read deadline in seconds.
    pub lmtp_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            storage_dir: PathBuf::from("./data"),
            auth_url: "http://127.0.0.1:8080/login".to_string(),
            auth_insecure: false,
            imap: ListenerConfig {
                tcp: Some("127.0.0.1:1143".to_string()),
                ..ListenerConfig::default()
            },
            lmtp: ListenerConfig {
                tcp: Some("127.0.0.1:1024".to_string()),
                ..ListenerConfig::default()
            },
            allowed_domains: Vec::new(),
            reject_unknown_user: false,
            max_size: 50 * 1024 * 1024,
            max_recipients: 100,
            lmtp_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> Result<Self, String> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("config {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.to_string()),
        };
        Self::parse(&text)
    }

    /// Parse the XML document.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut config = Self::default();
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        let mut in_domains = false;
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let name = e.name().as_ref().to_vec();
                    match name.as_slice() {
                        b"portalettere" => {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"hostname" {
                                    config.hostname = attr_value(&attr)?;
                                }
                            }
                        }
                        b"storage" => {
                            for attr in e.attributes().flatten() {
                                if attr.key.as_ref() == b"dir" {
                                    config.storage_dir = PathBuf::from(attr_value(&attr)?);
                                }
                            }
                        }
                        b"auth" => {
                            for attr in e.attributes().flatten() {
                                match attr.key.as_ref() {
                                    b"url" => config.auth_url = attr_value(&attr)?,
                                    b"insecure" => {
                                        config.auth_insecure = attr_value(&attr)? == "true"
                                    }
                                    _ => {}
                                }
                            }
                        }
                        b"imap" => {
                            config.imap = parse_listener(&e)?;
                        }
                        b"lmtp" => {
                            config.lmtp = parse_listener(&e)?;
                            for attr in e.attributes().flatten() {
                                match attr.key.as_ref() {
                                    b"max-size" => {
                                        config.max_size = parse_number(&attr_value(&attr)?)?
                                    }
                                    b"max-recipients" => {
                                        config.max_recipients =
                                            parse_number(&attr_value(&attr)?)? as u32
                                    }
                                    b"timeout" => {
                                        config.lmtp_timeout_secs =
                                            parse_number(&attr_value(&attr)?)?
                                    }
                                    b"reject-unknown-user" => {
                                        config.reject_unknown_user =
                                            attr_value(&attr)? == "true"
                                    }
                                    _ => {}
                                }
                            }
                        }
                        b"domains" => in_domains = true,
                        _ => {}
                    }
                }
                Ok(Event::Text(t)) if in_domains => {
                    let text = t.unescape().map_err(|e| e.to_string())?;
                    config.allowed_domains = text
                        .split_whitespace()
                        .map(|d| d.to_ascii_lowercase())
                        .collect();
                }
                Ok(Event::End(e)) if e.name().as_ref() == b"domains" => in_domains = false,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(format!("config parse error: {}", e)),
            }
        }
        Ok(config)
    }
}

fn parse_listener(e: &quick_xml::events::BytesStart<'_>) -> Result<ListenerConfig, String> {
    let mut listener = ListenerConfig::default();
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"tcp" => listener.tcp = Some(attr_value(&attr)?),
            b"socket" => listener.socket = Some(PathBuf::from(attr_value(&attr)?)),
            b"cert" => listener.tls_cert = Some(PathBuf::from(attr_value(&attr)?)),
            b"key" => listener.tls_key = Some(PathBuf::from(attr_value(&attr)?)),
            _ => {}
        }
    }
    Ok(listener)
}

fn attr_value(attr: &quick_xml::events::attributes::Attribute<'_>) -> Result<String, String> {
    attr.unescape_value()
        .map(|v| v.to_string())
        .map_err(|e| e.to_string())
}

fn parse_number(s: &str) -> Result<u64, String> {
    s.parse().map_err(|_| format!("not a number: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_document() {
        let xml = r#"<?xml version="1.0"?>
<portalettere hostname="mx.example.com">
  <storage dir="/var/lib/portalettere"/>
  <auth url="https://id.example.com/login" insecure="true"/>
  <imap tcp="0.0.0.0:143" socket="/run/imap.sock" cert="/etc/ssl/c.pem" key="/etc/ssl/k.pem"/>
  <lmtp tcp="127.0.0.1:24" max-size="1048576" max-recipients="5" timeout="60" reject-unknown-user="true"/>
  <domains>example.com Example.ORG</domains>
</portalettere>"#;
        let config = Config::parse(xml).unwrap();
        assert_eq!(config.hostname, "mx.example.com");
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/portalettere"));
        assert!(config.auth_insecure);
        assert_eq!(config.imap.tcp.as_deref(), Some("0.0.0.0:143"));
        assert_eq!(config.imap.tls_key, Some(PathBuf::from("/etc/ssl/k.pem")));
        assert_eq!(config.max_size, 1048576);
        assert_eq!(config.max_recipients, 5);
        assert_eq!(config.lmtp_timeout_secs, 60);
        assert!(config.reject_unknown_user);
        assert_eq!(config.allowed_domains, vec!["example.com", "example.org"]);
    }

    #[test]
    fn defaults_when_empty() {
        let config = Config::parse("<portalettere/>").unwrap();
        assert_eq!(config.hostname, "localhost");
        assert!(config.allowed_domains.is_empty());
        assert_eq!(config.max_size, 50 * 1024 * 1024);
    }
}
