//! Origin model and same-origin checks.
//!
//! Checks are conservative: anything that cannot be proven same-origin is
//! treated as cross-origin.

use url::Url;

/// A web origin (scheme + host + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A tuple origin (scheme, host, port).
    Tuple {
        scheme: String,
        host: String,
        port: Option<u16>,
    },
    /// An opaque origin (unique, cannot match anything).
    Opaque(String),
}

impl Origin {
    /// Create an origin from a URL.
    pub fn from_url(url: &Url) -> Self {
        // data:, file: and javascript: URLs are opaque
        if matches!(url.scheme(), "data" | "file" | "javascript") {
            return Origin::Opaque(url.to_string());
        }

        // blob: URLs inherit origin from their creator
        if url.scheme() == "blob" {
            if let Ok(inner_url) = Url::parse(url.path()) {
                return Origin::from_url(&inner_url);
            }
            return Origin::Opaque(url.to_string());
        }

        Origin::Tuple {
            scheme: url.scheme().to_string(),
            host: url.host_str().unwrap_or("").to_string(),
            port: url.port_or_known_default(),
        }
    }

    /// Check if two origins are the same.
    pub fn same_origin(&self, other: &Origin) -> bool {
        match (self, other) {
            (
                Origin::Tuple { scheme: s1, host: h1, port: p1 },
                Origin::Tuple { scheme: s2, host: h2, port: p2 },
            ) => s1 == s2 && h1.eq_ignore_ascii_case(h2) && p1 == p2,
            // never, not even with themselves
            _ => false,
        }
    }

    /// Check if a URL belongs to this origin.
    pub fn contains(&self, url: &Url) -> bool {
        self.same_origin(&Origin::from_url(url))
    }

    /// Check if this is an opaque origin.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Origin::Opaque(_))
    }

    /// Check if this is a potentially trustworthy origin (HTTPS, localhost).
    pub fn is_secure(&self) -> bool {
        match self {
            Origin::Tuple { scheme, host, .. } => {
                scheme == "https"
                    || host == "localhost"
                    || host == "127.0.0.1"
                    || host == "[::1]"
                    || host.ends_with(".localhost")
            }
            Origin::Opaque(_) => false,
        }
    }

    /// Serialize to string (for Origin header and logs).
    pub fn serialize(&self) -> String {
        match self {
            Origin::Tuple { scheme, host, port } => {
                let default_port = match scheme.as_str() {
                    "http" | "ws" => Some(80),
                    "https" | "wss" => Some(443),
                    _ => None,
                };

                match port {
                    Some(p) if *port != default_port => format!("{}://{}:{}", scheme, host, p),
                    _ => format!("{}://{}", scheme, host),
                }
            }
            Origin::Opaque(_) => "null".to_string(),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.serialize())
    }
}
