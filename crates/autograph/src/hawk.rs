use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

/// Authentication failures, mapped to 401 by the error layer.
///
/// Display strings are what the client sees; anything more specific
/// (expected values, canonical strings) is logged, never returned.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed hawk authorization header: {0}")]
    MalformedHeader(String),
    #[error("unknown hawk credential id")]
    UnknownPrincipal,
    #[error("hawk timestamp is outside the allowed skew")]
    StaleTimestamp,
    #[error("hawk payload hash does not match the request body")]
    BadPayloadHash,
    #[error("hawk mac validation failed")]
    BadMac,
    #[error("hawk nonce already seen, request replay rejected")]
    Replay,
    #[error("signer {0:?} is not authorized for this credential")]
    ForbiddenSigner(String),
}

/// Parsed attributes of an `Authorization: Hawk …` header.
#[derive(Debug, Clone)]
pub struct HawkHeader {
    pub id: String,
    pub ts: i64,
    pub nonce: String,
    pub mac: String,
    pub hash: Option<String>,
    pub ext: Option<String>,
}

/// The request fields covered by the Hawk canonical string.
#[derive(Debug, Clone)]
pub struct RequestInfo<'a> {
    /// Uppercase HTTP method.
    pub method: &'a str,
    /// Path including the query string.
    pub path: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub content_type: &'a str,
    pub body: &'a [u8],
}

/// Parses the `Authorization` header value as the Hawk scheme.
///
/// Attributes may appear in any order; unknown attributes are ignored
/// (the scheme defines `app`/`dlg` which this service does not use).
pub fn parse_header(value: &str) -> Result<HawkHeader, AuthError> {
    let rest = value
        .strip_prefix("Hawk ")
        .ok_or_else(|| AuthError::MalformedHeader("scheme is not Hawk".into()))?;

    let mut id = None;
    let mut ts = None;
    let mut nonce = None;
    let mut mac = None;
    let mut hash = None;
    let mut ext = None;

    for attr in rest.split(',') {
        let attr = attr.trim();
        if attr.is_empty() {
            continue;
        }
        let (key, raw) = attr
            .split_once('=')
            .ok_or_else(|| AuthError::MalformedHeader(format!("attribute {attr:?} has no value")))?;
        let val = raw
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .ok_or_else(|| AuthError::MalformedHeader(format!("attribute {key:?} is not quoted")))?;
        match key {
            "id" => id = Some(val.to_string()),
            "ts" => {
                let parsed = val
                    .parse::<i64>()
                    .map_err(|_| AuthError::MalformedHeader(format!("invalid timestamp {val:?}")))?;
                ts = Some(parsed);
            }
            "nonce" => nonce = Some(val.to_string()),
            "mac" => mac = Some(val.to_string()),
            "hash" => hash = Some(val.to_string()),
            "ext" => ext = Some(val.to_string()),
            _ => {}
        }
    }

    Ok(HawkHeader {
        id: id.ok_or_else(|| AuthError::MalformedHeader("missing id attribute".into()))?,
        ts: ts.ok_or_else(|| AuthError::MalformedHeader("missing ts attribute".into()))?,
        nonce: nonce.ok_or_else(|| AuthError::MalformedHeader("missing nonce attribute".into()))?,
        mac: mac.ok_or_else(|| AuthError::MalformedHeader("missing mac attribute".into()))?,
        hash,
        ext,
    })
}

/// `BASE64(SHA256("hawk.1.payload\n" + media_type + "\n" + body + "\n"))`.
///
/// The media type is the content type stripped of its parameters.
pub fn payload_hash(content_type: &str, body: &[u8]) -> String {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(b"hawk.1.payload\n");
    hasher.update(media_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(body);
    hasher.update(b"\n");
    B64.encode(hasher.finalize())
}

fn canonical_header_string(
    ts: i64,
    nonce: &str,
    method: &str,
    path: &str,
    host: &str,
    port: u16,
    hash: &str,
    ext: &str,
) -> String {
    format!(
        "hawk.1.header\n{ts}\n{nonce}\n{method}\n{path}\n{host}\n{port}\n{hash}\n{ext}\n",
        method = method.to_ascii_uppercase(),
        host = host.to_ascii_lowercase(),
    )
}

fn compute_mac(
    secret: &str,
    ts: i64,
    nonce: &str,
    method: &str,
    path: &str,
    host: &str,
    port: u16,
    hash: &str,
    ext: &str,
) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(canonical_header_string(ts, nonce, method, path, host, port, hash, ext).as_bytes());
    mac
}

/// Verifies a parsed header against the request it arrived on.
///
/// Checks in order: payload hash, MAC, timestamp skew. Stateless; replay
/// suppression happens in the nonce cache after this succeeds.
pub fn verify_request(
    header: &HawkHeader,
    secret: &str,
    req: &RequestInfo<'_>,
    max_skew: Duration,
    now: i64,
) -> Result<(), AuthError> {
    match &header.hash {
        Some(hash) => {
            let expected = payload_hash(req.content_type, req.body);
            if hash.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 0 {
                return Err(AuthError::BadPayloadHash);
            }
        }
        None if !req.body.is_empty() => return Err(AuthError::BadPayloadHash),
        None => {}
    }

    let mac = compute_mac(
        secret,
        header.ts,
        &header.nonce,
        req.method,
        req.path,
        req.host,
        req.port,
        header.hash.as_deref().unwrap_or(""),
        header.ext.as_deref().unwrap_or(""),
    );
    let claimed = B64.decode(&header.mac).map_err(|_| AuthError::BadMac)?;
    mac.verify_slice(&claimed).map_err(|_| AuthError::BadMac)?;

    if (now - header.ts).unsigned_abs() > max_skew.as_secs() {
        return Err(AuthError::StaleTimestamp);
    }

    Ok(())
}

/// Builds a complete `Authorization` header value for a request.
///
/// Client-side counterpart of [`verify_request`]; also used by the test
/// suites and the monitoring checks.
pub fn build_authorization_header(
    id: &str,
    secret: &str,
    req: &RequestInfo<'_>,
    ts: i64,
    nonce: &str,
    ext: &str,
) -> String {
    let hash = payload_hash(req.content_type, req.body);
    let mac = compute_mac(
        secret, ts, nonce, req.method, req.path, req.host, req.port, &hash, ext,
    );
    let mac = B64.encode(mac.finalize().into_bytes());
    format!(
        "Hawk id=\"{id}\", ts=\"{ts}\", nonce=\"{nonce}\", hash=\"{hash}\", ext=\"{ext}\", mac=\"{mac}\""
    )
}

/// Resolves the host and port the client signed over.
///
/// Taken from the `Host` header; when `trust_forwarded` is set the
/// `X-Forwarded-Host` and `X-Forwarded-Proto` headers win, with the
/// proto supplying the default port. A `Host` without a port falls back
/// to the listener port.
pub fn host_port(
    headers: &axum::http::HeaderMap,
    trust_forwarded: bool,
    fallback_port: u16,
) -> Result<(String, u16), AuthError> {
    let forwarded_host = if trust_forwarded {
        headers
            .get("x-forwarded-host")
            .and_then(|v| v.to_str().ok())
    } else {
        None
    };
    let host_value = match forwarded_host {
        Some(v) => v,
        None => headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::MalformedHeader("missing Host header".into()))?,
    };

    let default_port = if trust_forwarded {
        match headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
        {
            Some("https") => 443,
            Some("http") => 80,
            _ => fallback_port,
        }
    } else {
        fallback_port
    };

    // "host", "host:port", or a bracketed IPv6 literal.
    if let Some(rest) = host_value.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            AuthError::MalformedHeader(format!("unterminated IPv6 literal in Host {host_value:?}"))
        })?;
        return match after.strip_prefix(':') {
            Some(port) => port
                .parse::<u16>()
                .map(|port| (host.to_string(), port))
                .map_err(|_| {
                    AuthError::MalformedHeader(format!("invalid port in Host {host_value:?}"))
                }),
            None => Ok((host.to_string(), default_port)),
        };
    }
    match host_value.rsplit_once(':') {
        Some((host, port)) => port
            .parse::<u16>()
            .map(|port| (host.to_string(), port))
            .map_err(|_| AuthError::MalformedHeader(format!("invalid port in Host {host_value:?}"))),
        None => Ok((host_value.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request<'a>(body: &'a [u8]) -> RequestInfo<'a> {
        RequestInfo {
            method: "POST",
            path: "/sign/data",
            host: "localhost",
            port: 8000,
            content_type: "application/json",
            body,
        }
    }

    fn signed_header(id: &str, secret: &str, req: &RequestInfo<'_>, ts: i64) -> HawkHeader {
        let value = build_authorization_header(id, secret, req, ts, "abc123", "");
        parse_header(&value).unwrap()
    }

    #[test]
    fn roundtrip_verifies() {
        let req = test_request(b"[]");
        let header = signed_header("alice", "secret", &req, 1_700_000_000);
        verify_request(&header, "secret", &req, Duration::from_secs(60), 1_700_000_000).unwrap();
    }

    #[test]
    fn parse_rejects_non_hawk_scheme() {
        let err = parse_header("Bearer abc").unwrap_err();
        assert!(matches!(err, AuthError::MalformedHeader(_)));
    }

    #[test]
    fn parse_rejects_missing_mac() {
        let err = parse_header("Hawk id=\"a\", ts=\"1\", nonce=\"n\"").unwrap_err();
        assert!(matches!(err, AuthError::MalformedHeader(_)));
    }

    #[test]
    fn parse_accepts_any_attribute_order() {
        let header =
            parse_header("Hawk mac=\"m\", nonce=\"n\", ts=\"12\", id=\"a\", hash=\"h\"").unwrap();
        assert_eq!(header.id, "a");
        assert_eq!(header.ts, 12);
        assert_eq!(header.hash.as_deref(), Some("h"));
        assert!(header.ext.is_none());
    }

    #[test]
    fn tampered_body_fails_payload_hash() {
        let req = test_request(b"[]");
        let header = signed_header("alice", "secret", &req, 1_700_000_000);
        let tampered = test_request(b"[{}]");
        let err = verify_request(
            &header,
            "secret",
            &tampered,
            Duration::from_secs(60),
            1_700_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::BadPayloadHash));
    }

    #[test]
    fn flipped_mac_fails() {
        let req = test_request(b"[]");
        let mut header = signed_header("alice", "secret", &req, 1_700_000_000);
        // Flip one character of the base64 MAC.
        let mut mac = header.mac.into_bytes();
        mac[0] = if mac[0] == b'A' { b'B' } else { b'A' };
        header.mac = String::from_utf8(mac).unwrap();
        let err = verify_request(
            &header,
            "secret",
            &req,
            Duration::from_secs(60),
            1_700_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::BadMac));
    }

    #[test]
    fn wrong_secret_fails_mac() {
        let req = test_request(b"[]");
        let header = signed_header("alice", "secret", &req, 1_700_000_000);
        let err = verify_request(
            &header,
            "other-secret",
            &req,
            Duration::from_secs(60),
            1_700_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::BadMac));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let req = test_request(b"[]");
        let header = signed_header("alice", "secret", &req, 1_700_000_000);
        let err = verify_request(
            &header,
            "secret",
            &req,
            Duration::from_secs(60),
            1_700_000_061,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::StaleTimestamp));
        // One second inside the window still passes.
        verify_request(
            &header,
            "secret",
            &req,
            Duration::from_secs(60),
            1_700_000_060,
        )
        .unwrap();
    }

    #[test]
    fn missing_hash_with_body_rejected() {
        let req = test_request(b"[]");
        let mut header = signed_header("alice", "secret", &req, 1_700_000_000);
        header.hash = None;
        let err = verify_request(
            &header,
            "secret",
            &req,
            Duration::from_secs(60),
            1_700_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::BadPayloadHash));
    }

    #[test]
    fn payload_hash_strips_media_type_parameters() {
        assert_eq!(
            payload_hash("application/json; charset=utf-8", b"x"),
            payload_hash("application/json", b"x"),
        );
    }

    #[test]
    fn host_port_from_host_header() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::HOST, "signer.example.net:9000".parse().unwrap());
        let (host, port) = host_port(&headers, false, 8000).unwrap();
        assert_eq!(host, "signer.example.net");
        assert_eq!(port, 9000);
    }

    #[test]
    fn host_without_port_uses_fallback() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::HOST, "signer.example.net".parse().unwrap());
        let (host, port) = host_port(&headers, false, 8000).unwrap();
        assert_eq!(host, "signer.example.net");
        assert_eq!(port, 8000);
    }

    #[test]
    fn forwarded_host_ignored_unless_trusted() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::HOST, "internal:8000".parse().unwrap());
        headers.insert("x-forwarded-host", "public.example.net".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());

        let (host, port) = host_port(&headers, false, 8000).unwrap();
        assert_eq!((host.as_str(), port), ("internal", 8000));

        let (host, port) = host_port(&headers, true, 8000).unwrap();
        assert_eq!((host.as_str(), port), ("public.example.net", 443));
    }
}
