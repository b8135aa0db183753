//! BiDi UrlPattern parsing and matching
//!
//! Two wire forms: a literal URL string matched by equality after
//! normalisation, and a component pattern where every absent component
//! matches anything. Scheme and host compare case-insensitively, the rest is
//! case-sensitive.

use url::Url;

use crate::error::CommandError;
use crate::protocol::UrlPatternSpec;

/// A parsed, ready-to-match URL pattern
#[derive(Debug, Clone)]
pub enum UrlPattern {
    Literal(Url),
    Components {
        protocol: Option<String>,
        hostname: Option<String>,
        port: Option<String>,
        pathname: Option<String>,
        search: Option<String>,
    },
}

impl UrlPattern {
    /// Parse and normalise a wire pattern
    pub fn parse(spec: &UrlPatternSpec) -> Result<UrlPattern, CommandError> {
        match spec {
            UrlPatternSpec::String { pattern } => {
                let mut url = Url::parse(pattern).map_err(|err| {
                    CommandError::invalid_argument(format!("Invalid url pattern '{pattern}': {err}"))
                })?;
                url.set_fragment(None);
                Ok(UrlPattern::Literal(url))
            }
            UrlPatternSpec::Pattern {
                protocol,
                hostname,
                port,
                pathname,
                search,
            } => Ok(UrlPattern::Components {
                protocol: protocol
                    .as_ref()
                    .map(|p| p.trim_end_matches(':').to_ascii_lowercase()),
                hostname: hostname.as_ref().map(|h| h.to_ascii_lowercase()),
                port: port.clone(),
                pathname: pathname.as_ref().map(|p| {
                    if p.starts_with('/') {
                        p.clone()
                    } else {
                        format!("/{p}")
                    }
                }),
                search: search.as_ref().map(|s| s.trim_start_matches('?').to_string()),
            }),
        }
    }

    /// Whether the pattern matches an already-parsed URL
    pub fn matches(&self, url: &Url) -> bool {
        match self {
            UrlPattern::Literal(pattern) => {
                let mut candidate = url.clone();
                candidate.set_fragment(None);
                *pattern == candidate
            }
            UrlPattern::Components {
                protocol,
                hostname,
                port,
                pathname,
                search,
            } => {
                if let Some(protocol) = protocol {
                    if url.scheme() != protocol {
                        return false;
                    }
                }
                if let Some(hostname) = hostname {
                    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
                    if &host != hostname {
                        return false;
                    }
                }
                if let Some(port) = port {
                    let effective = url
                        .port_or_known_default()
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    if &effective != port {
                        return false;
                    }
                }
                if let Some(pathname) = pathname {
                    if url.path() != pathname {
                        return false;
                    }
                }
                if let Some(search) = search {
                    if url.query().unwrap_or("") != search {
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Match against a URL string; unparseable candidates never match
    pub fn matches_str(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(url) => self.matches(&url),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(pattern: &str) -> UrlPattern {
        UrlPattern::parse(&UrlPatternSpec::String {
            pattern: pattern.into(),
        })
        .unwrap()
    }

    fn components(
        protocol: Option<&str>,
        hostname: Option<&str>,
        port: Option<&str>,
        pathname: Option<&str>,
        search: Option<&str>,
    ) -> UrlPattern {
        UrlPattern::parse(&UrlPatternSpec::Pattern {
            protocol: protocol.map(String::from),
            hostname: hostname.map(String::from),
            port: port.map(String::from),
            pathname: pathname.map(String::from),
            search: search.map(String::from),
        })
        .unwrap()
    }

    #[test]
    fn literal_matches_after_normalisation() {
        let pattern = literal("HTTP://EXAMPLE.com/path");
        assert!(pattern.matches_str("http://example.com/path"));
        assert!(!pattern.matches_str("http://example.com/other"));
        // Fragments are not part of the comparison
        assert!(pattern.matches_str("http://example.com/path#section"));
    }

    #[test]
    fn literal_rejects_garbage() {
        let err = UrlPattern::parse(&UrlPatternSpec::String {
            pattern: "not a url".into(),
        });
        assert!(err.is_err());
    }

    #[test]
    fn absent_components_match_anything() {
        let pattern = components(None, None, None, None, None);
        assert!(pattern.matches_str("http://anything.example/whatever?q=1"));
        assert!(pattern.matches_str("https://127.0.0.1:8443/"));
    }

    #[test]
    fn hostname_is_case_insensitive() {
        let pattern = components(None, Some("Example.COM"), None, None, None);
        assert!(pattern.matches_str("http://EXAMPLE.com/"));
        assert!(!pattern.matches_str("http://example.org/"));
    }

    #[test]
    fn pathname_is_case_sensitive() {
        let pattern = components(None, None, None, Some("/Path"), None);
        assert!(pattern.matches_str("http://example.com/Path"));
        assert!(!pattern.matches_str("http://example.com/path"));
    }

    #[test]
    fn port_uses_scheme_default() {
        let pattern = components(None, None, Some("443"), None, None);
        assert!(pattern.matches_str("https://example.com/"));
        assert!(!pattern.matches_str("http://example.com/"));
    }

    #[test]
    fn protocol_tolerates_trailing_colon() {
        let pattern = components(Some("https:"), None, None, None, None);
        assert!(pattern.matches_str("https://example.com/"));
        assert!(!pattern.matches_str("http://example.com/"));
    }

    #[test]
    fn search_strips_question_mark() {
        let pattern = components(None, None, None, None, Some("?a=1"));
        assert!(pattern.matches_str("http://example.com/p?a=1"));
        assert!(!pattern.matches_str("http://example.com/p?a=2"));
        assert!(!pattern.matches_str("http://example.com/p"));
    }
}
