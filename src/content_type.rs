use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors returned when a content type cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentTypeParseError {
    /// The input was empty or only whitespace.
    #[error("empty content type")]
    Empty,
    /// The `type/subtype` part is malformed.
    #[error("invalid media type {0:?}")]
    InvalidMediaType(String),
    /// A `key=value` parameter is malformed.
    #[error("invalid media parameter {0:?}")]
    InvalidParameter(String),
    /// The same parameter key appears twice.
    #[error("duplicate media parameter {0:?}")]
    DuplicateParameter(String),
}

/// A parsed `type/subtype; key=value` content type.
///
/// The media type is lowercased. Parameter keys and values are kept exactly as
/// written, apart from unquoting quoted values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    media_type: String,
    params: BTreeMap<String, String>,
}

impl ContentType {
    /// Lowercased `type/subtype`.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Looks up a parameter by its exact key.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns whether `candidate` satisfies this configured type.
    ///
    /// Matching is asymmetric: a configured type without parameters
    /// matches any candidate with the same media type, while a configured type
    /// with parameters requires the candidate to carry exactly the same set.
    pub fn matches(&self, candidate: &ContentType) -> bool {
        if self.media_type != candidate.media_type {
            return false;
        }
        if self.params.is_empty() {
            return true;
        }
        self.params.len() == candidate.params.len()
            && self
                .params
                .iter()
                .all(|(key, value)| candidate.params.get(key) == Some(value))
    }
}

impl FromStr for ContentType {
    type Err = ContentTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (media, rest) = match s.find(';') {
            Some(idx) => (&s[..idx], &s[idx + 1..]),
            None => (s, ""),
        };
        let media = media.trim();
        if media.is_empty() {
            return Err(ContentTypeParseError::Empty);
        }
        let (kind, subtype) = media
            .split_once('/')
            .ok_or_else(|| ContentTypeParseError::InvalidMediaType(media.to_owned()))?;
        if !is_token(kind.trim()) || !is_token(subtype.trim()) {
            return Err(ContentTypeParseError::InvalidMediaType(media.to_owned()));
        }
        let media_type = format!("{}/{}", kind.trim(), subtype.trim()).to_ascii_lowercase();

        let mut params = BTreeMap::new();
        for segment in split_params(rest) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ContentTypeParseError::InvalidParameter(segment.to_owned()))?;
            let key = key.trim();
            if !is_token(key) {
                return Err(ContentTypeParseError::InvalidParameter(segment.to_owned()));
            }
            let value = parse_value(value.trim())
                .ok_or_else(|| ContentTypeParseError::InvalidParameter(segment.to_owned()))?;
            if params.insert(key.to_owned(), value).is_some() {
                return Err(ContentTypeParseError::DuplicateParameter(key.to_owned()));
            }
        }

        Ok(Self { media_type, params })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (key, value) in &self.params {
            if is_token(value) {
                write!(f, "; {key}={value}")?;
            } else {
                write!(f, "; {key}=\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))?;
            }
        }
        Ok(())
    }
}

/// Returns whether `candidate` is allowed by `allowlist`.
///
/// An empty allow-list accepts everything, including unparseable candidates.
pub(crate) fn is_allowed(allowlist: &[ContentType], candidate: &str) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    match candidate.parse::<ContentType>() {
        Ok(candidate) => allowlist.iter().any(|allowed| allowed.matches(&candidate)),
        Err(_) => false,
    }
}

/// Splits on `;` outside of quoted strings.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_value(raw: &str) -> Option<String> {
    let Some(inner) = raw.strip_prefix('"') else {
        return is_token(raw).then(|| raw.to_owned());
    };
    let inner = inner.strip_suffix('"')?;
    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => value.push(chars.next()?),
            '"' => return None,
            _ => value.push(ch),
        }
    }
    Some(value)
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_graphic()
                && !matches!(
                    b,
                    b'(' | b')'
                        | b'<'
                        | b'>'
                        | b'@'
                        | b','
                        | b';'
                        | b':'
                        | b'\\'
                        | b'"'
                        | b'/'
                        | b'['
                        | b']'
                        | b'?'
                        | b'='
                )
        })
}
