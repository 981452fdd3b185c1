//! Conversion between caller-facing header pairs and gRPC metadata.
//!
//! The host hands headers to the invoker as `(name, value)` pairs; response
//! headers and trailers travel back as a `name -> values` multimap. Binary
//! metadata (keys ending in `-bin`) is base64 on the caller side.

use std::collections::HashMap;
use std::sync::LazyLock;

use base64::Engine;
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, KeyAndValueRef,
    MetadataMap,
};

use crate::error::{Error, Result};

/// Base64 engines tried in order when decoding `-bin` values. Servers and
/// tools disagree on padding and alphabet, so all four common codecs are
/// accepted.
static BASE64_ENGINES: LazyLock<Vec<base64::engine::GeneralPurpose>> = LazyLock::new(|| {
    use base64::engine::general_purpose;
    vec![
        general_purpose::STANDARD,
        general_purpose::URL_SAFE,
        general_purpose::STANDARD_NO_PAD,
        general_purpose::URL_SAFE_NO_PAD,
    ]
});

/// Build a [`MetadataMap`] from caller-supplied header pairs.
///
/// Names are lowercased. Values for `-bin` keys are base64-decoded (falling
/// back to the raw bytes when no codec accepts them). Invalid keys or
/// values fail the whole conversion; a request must not go out with part of
/// its metadata silently dropped.
pub fn from_pairs(pairs: &[(String, String)]) -> Result<MetadataMap> {
    let mut map = MetadataMap::new();

    for (name, value) in pairs {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(Error::InvalidMetadata("empty header name".into()));
        }

        if name.ends_with("-bin") {
            let key = BinaryMetadataKey::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidMetadata(name.clone()))?;
            let bytes =
                try_base64_decode(value).unwrap_or_else(|| value.clone().into_bytes());
            map.append_bin(key, BinaryMetadataValue::from_bytes(&bytes));
        } else {
            let key = AsciiMetadataKey::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidMetadata(name.clone()))?;
            let value: AsciiMetadataValue = value
                .trim()
                .parse()
                .map_err(|_| Error::InvalidMetadata(name.clone()))?;
            map.append(key, value);
        }
    }

    Ok(map)
}

/// Flatten a [`MetadataMap`] into a `name -> values` multimap for the host.
/// Binary values are emitted as standard base64.
pub fn to_multimap(md: &MetadataMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();

    for entry in md.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                let Ok(text) = value.to_str() else { continue };
                out.entry(key.to_string()).or_default().push(text.to_string());
            }
            KeyAndValueRef::Binary(key, value) => {
                let bytes = value.to_bytes().unwrap_or_default();
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                out.entry(key.to_string()).or_default().push(encoded);
            }
        }
    }

    out
}

fn try_base64_decode(value: &str) -> Option<Vec<u8>> {
    BASE64_ENGINES
        .iter()
        .find_map(|engine| engine.decode(value.trim()).ok())
}
