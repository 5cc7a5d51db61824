//! Cache key codec.
//!
//! A card request is identified by `(template, title, options)`. On the wire the
//! title travels as base64 of its percent-encoded text inside the file segment
//! (`<base64>.png`); in storage the request maps onto a hierarchical key:
//!
//! ```text
//! <template>/[<percent-encoded option query>/]<percent-encoded title>.png
//! ```
//!
//! The option segment is omitted entirely when there are no options so keys never
//! contain an empty path segment.

use std::fmt;

use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::URL_SAFE},
};

use crate::domain::{
    card::{PNG_EXTENSION, RenderRequest},
    error::RequestError,
    options::OptionSet,
};

/// Upper bound on key length, matching the common object-store key limit.
pub const MAX_KEY_BYTES: usize = 1024;

/// Accepts standard base64 with or without padding once URL-safe characters are mapped.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Storage key for a rendered card.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-built key. Callers are responsible for path safety.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the storage key for a request.
pub fn cache_key(request: &RenderRequest) -> Result<CacheKey, RequestError> {
    encode(&request.template, &request.title, &request.options)
}

/// Build the storage key from its parts.
pub fn encode(template: &str, title: &str, options: &OptionSet) -> Result<CacheKey, RequestError> {
    let mut key = String::with_capacity(template.len() + title.len() + 16);
    key.push_str(&urlencoding::encode(template));
    key.push('/');

    let query = options.to_query();
    if !query.is_empty() {
        key.push_str(&urlencoding::encode(&query));
        key.push('/');
    }

    key.push_str(&urlencoding::encode(title));
    key.push_str(PNG_EXTENSION);

    if key.len() > MAX_KEY_BYTES {
        return Err(RequestError::KeyTooLong {
            length: key.len(),
            limit: MAX_KEY_BYTES,
        });
    }

    Ok(CacheKey(key))
}

/// Encode a title for the request path (without the `.png` suffix).
pub fn encode_title(title: &str) -> String {
    URL_SAFE.encode(urlencoding::encode(title).as_bytes())
}

/// Decode a title produced by [`encode_title`] or any compatible client.
pub fn decode_title(encoded: &str) -> Result<String, RequestError> {
    let normalized: String = encoded
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();

    let bytes = LENIENT_BASE64
        .decode(normalized.as_bytes())
        .map_err(|err| RequestError::malformed_title(format!("invalid base64: {err}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| RequestError::malformed_title("decoded bytes are not UTF-8"))?;

    urlencoding::decode(&text)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| RequestError::malformed_title("percent-decoded title is not UTF-8"))
}

/// Strip the `.png` suffix from a file segment and decode the title it carries.
pub fn decode_file_segment(file: &str) -> Result<String, RequestError> {
    let encoded = file.strip_suffix(PNG_EXTENSION).ok_or_else(|| {
        RequestError::unrecognized_path(format!("`{file}` does not end in {PNG_EXTENSION}"))
    })?;
    decode_title(encoded)
}

/// Public request path for a card, the inverse of the HTTP route.
pub fn request_path(request: &RenderRequest) -> String {
    let mut path = format!(
        "/{}/{}{}",
        urlencoding::encode(&request.template),
        encode_title(&request.title),
        PNG_EXTENSION
    );
    let compact = request.options.to_compact();
    if !compact.is_empty() {
        path.push_str("?options=");
        path.push_str(&urlencoding::encode(&compact));
    }
    path
}
