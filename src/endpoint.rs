//! Endpoints published by ready processes and the `{{name.field}}` placeholders that consume
//! them.
use std::{collections::HashMap, fmt, sync::LazyLock};

use regex::{Captures, Regex};
use reqwest::Url;

use crate::readiness::ReadinessCheck;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\.([A-Za-z]+)\s*\}\}")
        .expect("placeholder pattern is valid")
});

/// Network location a ready process can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

/// Field of an endpoint that a placeholder can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointField {
    Host,
    Port,
    /// `host:port`
    Address,
    /// `scheme://host:port`
    Url,
}

impl EndpointField {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(EndpointField::Host),
            "port" => Some(EndpointField::Port),
            "endpoint" | "address" => Some(EndpointField::Address),
            "url" => Some(EndpointField::Url),
            _ => None,
        }
    }
}

/// A `{{process.field}}` reference found in a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub process: String,
    pub field: Option<EndpointField>,
    pub raw: String,
}

impl Endpoint {
    /// Parses either a URL (`http://host:port/path`) or a bare `host:port`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.contains("://") {
            let url = Url::parse(raw).map_err(|err| format!("invalid URL '{raw}': {err}"))?;
            return Self::from_url(&url);
        }

        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint '{raw}' must look like host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("endpoint '{raw}' has an empty host"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("endpoint '{raw}' has an invalid port"))?;

        Ok(Self {
            scheme: "http".into(),
            host: host.to_string(),
            port,
        })
    }

    fn from_url(url: &Url) -> Result<Self, String> {
        let host = url
            .host_str()
            .ok_or_else(|| format!("URL '{url}' has no host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| format!("URL '{url}' has no port"))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            port,
        })
    }

    /// Endpoint implied by a readiness check, if the check probes a network location.
    pub fn from_check(check: &ReadinessCheck) -> Option<Self> {
        match check {
            ReadinessCheck::TcpConnect { host, port } => Some(Self {
                scheme: "http".into(),
                host: host.clone(),
                port: *port,
            }),
            ReadinessCheck::HttpGet { url, .. } => {
                Url::parse(url).ok().and_then(|url| Self::from_url(&url).ok())
            }
            ReadinessCheck::FixedDelay(_) => None,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://host:port`
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.address())
    }

    /// Renders one field.
    pub fn field(&self, field: EndpointField) -> String {
        match field {
            EndpointField::Host => self.host.clone(),
            EndpointField::Port => self.port.to_string(),
            EndpointField::Address => self.address(),
            EndpointField::Url => self.url(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Lists every placeholder in `input`, including ones with unknown fields.
pub fn placeholders(input: &str) -> Vec<Placeholder> {
    PLACEHOLDER
        .captures_iter(input)
        .map(|caps| Placeholder {
            process: caps[1].to_string(),
            field: EndpointField::parse(&caps[2]),
            raw: caps[0].to_string(),
        })
        .collect()
}

/// Replaces placeholders with values from `endpoints`.
///
/// Fails with the first placeholder that cannot be resolved.
pub fn substitute(
    input: &str,
    endpoints: &HashMap<String, Endpoint>,
) -> Result<String, String> {
    let mut unresolved = None;
    let output = PLACEHOLDER.replace_all(input, |caps: &Captures| {
        let resolved = EndpointField::parse(&caps[2])
            .zip(endpoints.get(&caps[1]))
            .map(|(field, endpoint)| endpoint.field(field));
        match resolved {
            Some(value) => value,
            None => {
                unresolved.get_or_insert_with(|| caps[0].to_string());
                caps[0].to_string()
            }
        }
    });

    match unresolved {
        Some(raw) => Err(raw),
        None => Ok(output.into_owned()),
    }
}
