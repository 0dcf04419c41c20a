//! https URL parsing, path encoding, and redirect resolution.

use crate::error::FetchError;

const DEFAULT_PORT: u16 = 443;

/// Parsed https target. `path` never carries the leading slash; the request
/// line adds it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpsUri {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl HttpsUri {
    /// Split a URL into host, port and path. Fails unless the scheme is
    /// `https`, a path separator is present, and the host component (including
    /// bracketed IPv6 literals) parses.
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let rest = strip_scheme(url)
            .ok_or_else(|| FetchError::InvalidUrl(format!("{}: not an https url", safe_display(url))))?;
        let slash = rest
            .find('/')
            .ok_or_else(|| FetchError::InvalidUrl(format!("{}: missing path", safe_display(url))))?;
        let (authority, path) = rest.split_at(slash);
        let path = &path[1..];

        let (host, port) = if let Some(inner) = authority.strip_prefix('[') {
            let close = inner
                .rfind(']')
                .ok_or_else(|| FetchError::InvalidUrl(format!("{}: unmatched bracket", safe_display(url))))?;
            let mut host = &inner[..close];
            // drop any interface scope
            if let Some(pct) = host.find('%') {
                host = &host[..pct];
            }
            let port = match &inner[close + 1..] {
                "" => DEFAULT_PORT,
                tail => parse_port(tail.strip_prefix(':').ok_or_else(|| {
                    FetchError::InvalidUrl(format!("{}: garbage after bracket", safe_display(url)))
                })?)
                .ok_or_else(|| FetchError::InvalidUrl(format!("{}: bad port", safe_display(url))))?,
            };
            (host, port)
        } else {
            match authority.rfind(':') {
                Some(i) => {
                    let port = parse_port(&authority[i + 1..]).ok_or_else(|| {
                        FetchError::InvalidUrl(format!("{}: bad port", safe_display(url)))
                    })?;
                    (&authority[..i], port)
                }
                None => (authority, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(FetchError::InvalidUrl(format!("{}: empty host", safe_display(url))));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host[:port]`, bracketing IPv6 literals, for URL reconstruction.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == DEFAULT_PORT {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// `Host` header value. The port is omitted when it equals the default;
    /// some servers get confused when told their own port.
    pub fn host_header(&self) -> String {
        self.authority()
    }

    /// Rebuild the full URL, mainly for logging and redirect bases.
    pub fn to_url(&self) -> String {
        format!("https://{}/{}", self.authority(), self.path)
    }
}

fn strip_scheme(url: &str) -> Option<&str> {
    let scheme = url.get(..8)?;
    scheme.eq_ignore_ascii_case("https://").then(|| &url[8..])
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// RFC1738: a byte needs encoding when it has no graphic US-ASCII form, is in
/// the unsafe set, or is a `%` not followed by two hex digits.
fn unsafe_byte(bytes: &[u8], i: usize) -> bool {
    const UNSAFE: &[u8] = b" <>\"#{}|\\^~[]`";
    let b = bytes[i];
    if b.is_ascii_control() || !b.is_ascii() || UNSAFE.contains(&b) {
        return true;
    }
    b == b'%'
        && !(bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
            && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit))
}

/// Percent-encode a path for the request line. Well-formed `%XX` triplets are
/// left alone, so encoding is idempotent.
pub fn encode_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    for i in 0..bytes.len() {
        if unsafe_byte(bytes, i) {
            out.push_str(&format!("%{:02X}", bytes[i]));
        } else {
            out.push(bytes[i] as char);
        }
    }
    out
}

/// Resolve a `Location` header against the current target.
///
/// Absolute URLs are re-parsed in full; a leading `/` is host-relative; any
/// other form resolves against the directory of the current path. Fragments
/// are stripped. Protocol-relative (`//host/path`) locations are *not*
/// recognized and fall into the host-relative branch; changing that would
/// silently retarget redirects that today stay on-host.
pub fn resolve_redirect(base: &HttpsUri, location: &str) -> Result<HttpsUri, FetchError> {
    // A colon before the first slash means the URI is absolute (RFC 3986 4.2).
    let absolute = location
        .find(|c| c == ':' || c == '/')
        .is_some_and(|i| location.as_bytes()[i] == b':');

    let mut url = if absolute {
        location.to_string()
    } else if let Some(rel) = location.strip_prefix('/') {
        format!("https://{}/{}", base.authority(), rel)
    } else {
        let mut dir = base.path.as_str();
        if let Some(i) = dir.find('#') {
            dir = &dir[..i];
        }
        if let Some(i) = dir.find('?') {
            dir = &dir[..i];
        }
        let dir = match dir.rfind('/') {
            Some(i) => &dir[..=i],
            None => "",
        };
        format!("https://{}/{}{}", base.authority(), dir, location)
    };
    if let Some(i) = url.find('#') {
        url.truncate(i);
    }
    HttpsUri::parse(&url)
}

/// Render untrusted remote input (URLs, header fragments) fit for a log
/// line: non-printable bytes become `\xNN` escapes and long strings are
/// clipped.
pub fn safe_display(raw: &str) -> String {
    const LIMIT: usize = 80;
    let mut out = String::new();
    for b in raw.bytes() {
        if out.len() >= LIMIT {
            out.push_str("...");
            break;
        }
        match b {
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}
