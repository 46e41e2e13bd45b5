//! Location strings for sources and destinations.
//!
//! Sources are `[HOST[:PORT]:]ATTRIBUTE`, destinations are
//! `HOST[:PORT][(ALTHOST)][:ATTRIBUTE]`. A segment after the host that is
//! entirely digits is always taken as the port, so a purely numeric
//! attribute cannot follow a host.

use crate::{Result, ZmigrateError};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Data-plane endpoint for transfers. Control commands always go to `host`.
    pub alternate_host: Option<String>,
    pub attribute: Option<String>,
}

impl Address {
    pub fn local(attribute: &str) -> Self {
        Self {
            host: None,
            port: None,
            alternate_host: None,
            attribute: Some(attribute.to_string()),
        }
    }

    pub fn parse_source(raw: &str) -> Result<Self> {
        if raw.contains(['(', ')']) {
            return Err(invalid(raw, "alternate host is only accepted on destinations"));
        }

        let (host, port, attribute) = match raw.split_once(':') {
            None => (None, None, raw),
            Some((host, rest)) => match rest.split_once(':') {
                Some((second, attribute)) if is_port(second) => {
                    (Some(host), Some(parse_port(raw, second)?), attribute)
                }
                _ if is_port(rest) => {
                    return Err(invalid(raw, "missing attribute after port"));
                }
                _ => (Some(host), None, rest),
            },
        };

        if host.is_some_and(str::is_empty) {
            return Err(invalid(raw, "empty host"));
        }
        if attribute.is_empty() {
            return Err(invalid(raw, "missing attribute"));
        }

        Ok(Self {
            host: host.map(str::to_string),
            port,
            alternate_host: None,
            attribute: Some(attribute.to_string()),
        })
    }

    pub fn parse_destination(raw: &str) -> Result<Self> {
        let (host, mut rest) = split_at_any(raw, &[':', '(']);
        if host.is_empty() {
            return Err(invalid(raw, "destination requires a host"));
        }

        let mut port = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (segment, tail) = split_at_any(after, &[':', '(']);
            if is_port(segment) {
                port = Some(parse_port(raw, segment)?);
                rest = tail;
            }
        }

        let mut alternate_host = None;
        if let Some(after) = rest.strip_prefix('(') {
            let close = after
                .find(')')
                .ok_or_else(|| invalid(raw, "unterminated alternate host"))?;
            let alternate = &after[..close];
            if alternate.is_empty() {
                return Err(invalid(raw, "empty alternate host"));
            }
            alternate_host = Some(alternate.to_string());
            rest = &after[close + 1..];
        }

        let attribute = if rest.is_empty() {
            None
        } else if let Some(attribute) = rest.strip_prefix(':') {
            if attribute.is_empty() {
                return Err(invalid(raw, "empty attribute after ':'"));
            }
            Some(attribute.to_string())
        } else {
            return Err(invalid(raw, "unexpected text after alternate host"));
        };

        Ok(Self {
            host: Some(host.to_string()),
            port,
            alternate_host,
            attribute,
        })
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    /// Host that bulk data should be streamed to.
    pub fn data_host(&self) -> Option<&str> {
        self.alternate_host.as_deref().or(self.host.as_deref())
    }

    /// Display name for logs: the host, or "localhost".
    pub fn host_label(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// Same endpoint, different attribute.
    pub fn with_attribute(&self, attribute: &str) -> Self {
        Self {
            attribute: Some(attribute.to_string()),
            ..self.clone()
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(host) = &self.host else {
            return write!(f, "{}", self.attribute.as_deref().unwrap_or(""));
        };

        write!(f, "{}", host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(alternate) = &self.alternate_host {
            write!(f, "({})", alternate)?;
        }
        if let Some(attribute) = &self.attribute {
            write!(f, ":{}", attribute)?;
        }
        Ok(())
    }
}

fn invalid(raw: &str, reason: &str) -> ZmigrateError {
    ZmigrateError::InvalidAddress {
        input: raw.to_string(),
        reason: reason.to_string(),
    }
}

fn is_port(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn parse_port(raw: &str, segment: &str) -> Result<u16> {
    segment
        .parse::<u16>()
        .map_err(|_| invalid(raw, "port out of range"))
}

fn split_at_any<'a>(s: &'a str, delimiters: &[char]) -> (&'a str, &'a str) {
    match s.find(delimiters) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}
