//! Connection URI formatting and parsing.
//!
//! Everything here is pure string work: no clock, no I/O. URIs follow the
//! `{scheme}://{identifier}@{host}:{port}?{query}#{remark}` shape shared by
//! the VLESS family of protocols.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("credential payload has no client identifier")]
    MissingIdentifier,

    #[error("endpoint has no host")]
    MissingHost,

    #[error("credential payload has no port")]
    MissingPort,

    #[error("malformed uri: {0}")]
    Malformed(String),
}

/// Typed form of a credential's opaque payload JSON.
///
/// `params` is a BTreeMap so formatting walks keys in a fixed order and a
/// given payload always renders to the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPayload {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Parts recovered from a connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: String,
    pub identifier: String,
    pub host: String,
    pub port: u16,
    pub params: BTreeMap<String, String>,
    pub remark: String,
}

/// Builds a connection URI from a credential payload and an endpoint host.
/// Query parameter keys and values pass through percent-encoded but otherwise
/// untouched; the remark lands percent-encoded in the fragment.
pub fn format_uri(
    scheme: &str,
    payload: &ConnectionPayload,
    host: &str,
    remark: &str,
) -> Result<String, UriError> {
    if payload.uuid.is_empty() {
        return Err(UriError::MissingIdentifier);
    }
    if host.is_empty() {
        return Err(UriError::MissingHost);
    }
    let port = payload.port.ok_or(UriError::MissingPort)?;

    let query = payload
        .params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut uri = format!("{}://{}@{}:{}", scheme, payload.uuid, host, port);
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }
    uri.push('#');
    uri.push_str(&urlencoding::encode(remark));
    Ok(uri)
}

/// Parses a connection URI back into its parts.
///
/// Port defaults to 443 when absent. For repeated query keys the first value
/// wins; `+` in query values reads as a space (form encoding), while the
/// fragment is plain percent-decoded.
pub fn parse_uri(uri: &str) -> Result<ParsedUri, UriError> {
    let parsed = url::Url::parse(uri).map_err(|e| UriError::Malformed(e.to_string()))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| UriError::Malformed("no host".into()))?
        .to_string();

    let mut params = BTreeMap::new();
    if let Some(query) = parsed.query() {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params
                .entry(decode_form(k))
                .or_insert_with(|| decode_form(v));
        }
    }

    Ok(ParsedUri {
        scheme: parsed.scheme().to_string(),
        identifier: decode(parsed.username()),
        host,
        port: parsed.port().unwrap_or(443),
        params,
        remark: parsed.fragment().map(decode).unwrap_or_default(),
    })
}

/// Replaces the remark fragment of a URI, leaving every byte before `#`
/// untouched. Works on URIs with or without an existing fragment.
pub fn rewrite_remark(uri: &str, new_remark: &str) -> String {
    let base = uri.split_once('#').map(|(b, _)| b).unwrap_or(uri);
    format!("{}#{}", base, urlencoding::encode(new_remark))
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn decode_form(s: &str) -> String {
    decode(&s.replace('+', "%20"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> ConnectionPayload {
        let mut params = BTreeMap::new();
        params.insert("security".into(), "reality".into());
        params.insert("pbk".into(), "public-key-value".into());
        params.insert("sni".into(), "cdn.example.com".into());
        params.insert("fp".into(), "chrome".into());
        ConnectionPayload {
            uuid: "9f86d081-884c-4d63-a1b5-0f0e4ce3f1aa".into(),
            port: Some(443),
            params,
        }
    }

    #[test]
    fn formats_full_uri_in_key_order() {
        let uri = format_uri("vless", &payload(), "nl1.example.com", "Amsterdam NL").unwrap();
        assert_eq!(
            uri,
            "vless://9f86d081-884c-4d63-a1b5-0f0e4ce3f1aa@nl1.example.com:443\
             ?fp=chrome&pbk=public-key-value&security=reality&sni=cdn.example.com\
             #Amsterdam%20NL"
        );
    }

    #[test]
    fn same_payload_always_renders_same_bytes() {
        let a = format_uri("vless", &payload(), "nl1.example.com", "x").unwrap();
        let b = format_uri("vless", &payload(), "nl1.example.com", "x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_fields_are_structured_errors() {
        let mut p = payload();
        p.uuid.clear();
        assert_eq!(
            format_uri("vless", &p, "h.example.com", "r"),
            Err(UriError::MissingIdentifier)
        );

        let p = payload();
        assert_eq!(
            format_uri("vless", &p, "", "r"),
            Err(UriError::MissingHost)
        );

        let mut p = payload();
        p.port = None;
        assert_eq!(
            format_uri("vless", &p, "h.example.com", "r"),
            Err(UriError::MissingPort)
        );
    }

    #[test]
    fn params_survive_round_trip() {
        let mut p = payload();
        p.params
            .insert("spider".into(), "/path?q=1&x y".into());
        let uri = format_uri("vless", &p, "nl1.example.com", "⏰ Амстердам").unwrap();

        let parsed = parse_uri(&uri).unwrap();
        assert_eq!(parsed.scheme, "vless");
        assert_eq!(parsed.identifier, p.uuid);
        assert_eq!(parsed.host, "nl1.example.com");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.params, p.params);
        assert_eq!(parsed.remark, "⏰ Амстердам");
    }

    #[test]
    fn parse_defaults_port_to_443() {
        let parsed = parse_uri("vless://abc@host.example.com#name").unwrap();
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.remark, "name");
        assert!(parsed.params.is_empty());
    }

    #[test]
    fn parse_keeps_first_of_repeated_keys() {
        let parsed = parse_uri("vless://abc@h.example.com:8443?flow=a&flow=b#r").unwrap();
        assert_eq!(parsed.params["flow"], "a");
    }

    #[test]
    fn parse_reads_plus_as_space_in_query_only() {
        let parsed = parse_uri("vless://abc@h.example.com:443?path=%2Fws+x#a+b").unwrap();
        assert_eq!(parsed.params["path"], "/ws x");
        // Fragments are plain percent-decoding; '+' stays literal.
        assert_eq!(parsed.remark, "a+b");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(parse_uri("not a uri"), Err(UriError::Malformed(_))));
    }

    #[test]
    fn rewrite_remark_touches_fragment_only() {
        let uri = format_uri("vless", &payload(), "nl1.example.com", "old name").unwrap();
        let rewritten = rewrite_remark(&uri, "⏰ new name");

        let base = uri.split_once('#').unwrap().0;
        let (new_base, new_frag) = rewritten.split_once('#').unwrap();
        assert_eq!(new_base, base);
        assert_eq!(new_frag, "%E2%8F%B0%20new%20name");
    }

    #[test]
    fn rewrite_remark_appends_when_fragment_missing() {
        assert_eq!(
            rewrite_remark("vless://u@h:443?a=1", "tag"),
            "vless://u@h:443?a=1#tag"
        );
    }
}
