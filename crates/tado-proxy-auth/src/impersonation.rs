//! Outgoing traffic shaped like the official web app and iOS app.
//!
//! Every upstream call goes through an [`HttpClients`] instance. The TLS
//! handshake, HTTP/2 flow-control settings and header order are fixed per
//! [`Platform`]:
//!
//! | Platform | Browser      | Request classes          |
//! |----------|--------------|--------------------------|
//! | `web`    | Firefox 147  | login page, token, API   |
//! | `mobile` | iOS Safari   | login page, token, API   |
//!
//! The header list of each request class is complete: callers provide the
//! per-request values (`cookie`, `content-type`, `authorization`, ...) and
//! they are placed in their captured positions.
//!
//! Header-table size, max concurrent streams, pseudo-header order and the
//! Firefox priority frames are part of each profile but hyper gives no
//! control over them, so they are recorded here and not emitted.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rustls::crypto::{CryptoProvider, SupportedKxGroup, ring};
use rustls::{ClientConfig, SupportedCipherSuite};
use rustls_platform_verifier::BuilderVerifierExt;
use tado_proxy_store::Platform;

use crate::error::Result;

/// Overall request timeout for every upstream call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default HTTP/2 connection window before any WINDOW_UPDATE.
const H2_DEFAULT_CONNECTION_WINDOW: u32 = 65_535;

// ─────────────────────────────────────────────────────────────────────────────
// Request classes and header templates
// ─────────────────────────────────────────────────────────────────────────────

/// The three kinds of upstream request, each with its own header list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Login page fetch, login form POST and redirect hops.
    Auth,
    /// Token endpoint calls (code exchange, refresh, device flow).
    Token,
    /// Authenticated API calls.
    Api,
}

/// One position in a captured header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSlot {
    /// Always sent with this literal value.
    Fixed(&'static str, &'static str),
    /// Sent only when the caller supplies a value.
    Dynamic(&'static str),
}

impl HeaderSlot {
    pub fn name(&self) -> &'static str {
        match self {
            HeaderSlot::Fixed(name, _) | HeaderSlot::Dynamic(name) => name,
        }
    }
}

use HeaderSlot::{Dynamic, Fixed};

// ─────────────────────────────────────────────────────────────────────────────
// HTTP/2 fingerprint
// ─────────────────────────────────────────────────────────────────────────────

/// A PRIORITY frame sent after the connection preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub depends_on: u32,
    pub exclusive: bool,
    pub weight: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Fingerprint {
    pub header_table_size: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    /// WINDOW_UPDATE increment sent on the connection stream.
    pub connection_flow: u32,
    pub pseudo_header_order: &'static [&'static str],
    pub priority_frames: &'static [PriorityFrame],
    /// Priority attached to each HEADERS frame.
    pub header_priority: PriorityFrame,
}

const fn priority(stream_id: u32, depends_on: u32, weight: u8) -> PriorityFrame {
    PriorityFrame {
        stream_id,
        depends_on,
        exclusive: false,
        weight,
    }
}

impl Http2Fingerprint {
    /// Connection-level receive window after the initial WINDOW_UPDATE.
    pub fn connection_window(&self) -> u32 {
        H2_DEFAULT_CONNECTION_WINDOW.saturating_add(self.connection_flow)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS fingerprint
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFingerprint {
    Firefox,
    Safari,
}

impl TlsFingerprint {
    /// Cipher suites in ClientHello order.
    pub fn cipher_suites(&self) -> Vec<SupportedCipherSuite> {
        use ring::cipher_suite::*;

        match self {
            TlsFingerprint::Firefox => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            TlsFingerprint::Safari => vec![
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
        }
    }

    /// Key-exchange groups in key-share order.
    pub fn kx_groups(&self) -> Vec<&'static dyn SupportedKxGroup> {
        vec![ring::kx_group::X25519, ring::kx_group::SECP256R1, ring::kx_group::SECP384R1]
    }

    /// Build a rustls config negotiating `h2` then `http/1.1`.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let provider = Arc::new(CryptoProvider {
            cipher_suites: self.cipher_suites(),
            kx_groups: self.kx_groups(),
            ..ring::default_provider()
        });

        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_platform_verifier()
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Profiles
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable fingerprint data for one impersonated client.
#[derive(Debug)]
pub struct ImpersonationProfile {
    pub name: &'static str,
    pub tls: TlsFingerprint,
    pub http2: Http2Fingerprint,
    /// Device name submitted with the login form.
    pub device_name: &'static str,
    auth_headers: &'static [HeaderSlot],
    token_headers: &'static [HeaderSlot],
    api_headers: &'static [HeaderSlot],
}

const FIREFOX_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:147.0) Gecko/20100101 Firefox/147.0";

const IOS_SAFARI_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_7 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/26.2 Mobile/15E148 Safari/604.1";

const IOS_WEBVIEW_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 18_7 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";

const IOS_APP_USER_AGENT: &str = "tado/14903 CFNetwork/3860.300.31 Darwin/25.2.0";

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const JSON_ACCEPT: &str = "application/json, text/plain, */*";

pub static FIREFOX: ImpersonationProfile = ImpersonationProfile {
    name: "firefox",
    tls: TlsFingerprint::Firefox,
    http2: Http2Fingerprint {
        header_table_size: Some(65_536),
        initial_window_size: 131_072,
        max_frame_size: Some(16_384),
        max_concurrent_streams: None,
        connection_flow: 12_517_377,
        pseudo_header_order: &[":method", ":path", ":authority", ":scheme"],
        priority_frames: &[
            priority(3, 0, 200),
            priority(5, 0, 100),
            priority(7, 0, 0),
            priority(9, 7, 0),
            priority(11, 3, 0),
            priority(13, 0, 240),
        ],
        header_priority: priority(0, 13, 41),
    },
    device_name: "Firefox on Linux",
    auth_headers: &[
        Fixed("user-agent", FIREFOX_USER_AGENT),
        Fixed("accept", HTML_ACCEPT),
        Fixed("accept-language", "de,en;q=0.9"),
        Fixed("accept-encoding", "gzip, deflate, br, zstd"),
        Dynamic("referer"),
        Dynamic("content-type"),
        Dynamic("content-length"),
        Dynamic("origin"),
        Fixed("dnt", "1"),
        Fixed("sec-gpc", "1"),
        Fixed("connection", "keep-alive"),
        Dynamic("cookie"),
        Fixed("upgrade-insecure-requests", "1"),
        Fixed("sec-fetch-dest", "document"),
        Fixed("sec-fetch-mode", "navigate"),
        Fixed("sec-fetch-site", "same-origin"),
        Fixed("sec-fetch-user", "?1"),
        Fixed("priority", "u=0, i"),
        Fixed("pragma", "no-cache"),
        Fixed("cache-control", "no-cache"),
        Fixed("te", "trailers"),
    ],
    token_headers: &[
        Fixed("user-agent", FIREFOX_USER_AGENT),
        Fixed("accept", JSON_ACCEPT),
        Fixed("accept-language", "de,en;q=0.9"),
        Fixed("accept-encoding", "gzip, deflate, br, zstd"),
        Fixed("referer", "https://app.tado.com/"),
        Dynamic("content-type"),
        Dynamic("content-length"),
        Fixed("origin", "https://app.tado.com"),
        Fixed("dnt", "1"),
        Fixed("sec-gpc", "1"),
        Fixed("connection", "keep-alive"),
        Fixed("sec-fetch-dest", "empty"),
        Fixed("sec-fetch-mode", "cors"),
        Fixed("sec-fetch-site", "same-site"),
        Fixed("pragma", "no-cache"),
        Fixed("cache-control", "no-cache"),
        Fixed("te", "trailers"),
    ],
    api_headers: &[
        Fixed("user-agent", FIREFOX_USER_AGENT),
        Fixed("accept", JSON_ACCEPT),
        Fixed("accept-language", "de,en;q=0.9"),
        Fixed("accept-encoding", "gzip, deflate, br, zstd"),
        Fixed("referer", "https://app.tado.com/"),
        Fixed("x-amzn-trace-id", "tado=webapp-release/v3835"),
        Dynamic("authorization"),
        Fixed("origin", "https://app.tado.com"),
        Fixed("dnt", "1"),
        Fixed("sec-gpc", "1"),
        Fixed("connection", "keep-alive"),
        Fixed("sec-fetch-dest", "empty"),
        Fixed("sec-fetch-mode", "cors"),
        Fixed("sec-fetch-site", "same-site"),
    ],
};

pub static IOS_SAFARI: ImpersonationProfile = ImpersonationProfile {
    name: "ios-safari",
    tls: TlsFingerprint::Safari,
    http2: Http2Fingerprint {
        header_table_size: None,
        initial_window_size: 4_194_304,
        max_frame_size: None,
        max_concurrent_streams: Some(100),
        connection_flow: 10_485_760,
        pseudo_header_order: &[":method", ":scheme", ":path", ":authority"],
        priority_frames: &[],
        header_priority: priority(0, 0, 254),
    },
    device_name: "iPhone/iPod Safari",
    auth_headers: &[
        Fixed("accept", HTML_ACCEPT),
        Dynamic("content-type"),
        Fixed("sec-fetch-site", "same-origin"),
        Dynamic("origin"),
        Fixed("sec-fetch-mode", "navigate"),
        Fixed("user-agent", IOS_SAFARI_USER_AGENT),
        Dynamic("referer"),
        Fixed("sec-fetch-dest", "document"),
        Dynamic("content-length"),
        Fixed("accept-language", "de-DE,de;q=0.9"),
        Fixed("priority", "u=0, i"),
        Fixed("accept-encoding", "gzip, deflate, br"),
        Dynamic("cookie"),
    ],
    token_headers: &[
        Fixed("accept", "*/*"),
        Dynamic("content-type"),
        Fixed("accept-language", "de-DE,de;q=0.9"),
        Fixed("accept-encoding", "gzip, deflate, br"),
        Fixed("user-agent", IOS_APP_USER_AGENT),
        Fixed("priority", "u=3"),
        Dynamic("content-length"),
    ],
    api_headers: &[
        Fixed("accept", JSON_ACCEPT),
        Dynamic("authorization"),
        Fixed("x-amzn-trace-id", "tado=iOS-14903"),
        Fixed("accept-language", "de-DE,de;q=0.9"),
        Fixed("user-agent", IOS_WEBVIEW_USER_AGENT),
        Fixed("priority", "u=3"),
        Fixed("accept-encoding", "gzip, deflate, br"),
    ],
};

impl ImpersonationProfile {
    pub fn for_platform(platform: Platform) -> &'static ImpersonationProfile {
        match platform {
            Platform::Web => &FIREFOX,
            Platform::Mobile => &IOS_SAFARI,
        }
    }

    /// Captured header order for a request class.
    pub fn header_slots(&self, class: RequestClass) -> &'static [HeaderSlot] {
        match class {
            RequestClass::Auth => self.auth_headers,
            RequestClass::Token => self.token_headers,
            RequestClass::Api => self.api_headers,
        }
    }

    /// Build the complete, ordered header map for one request.
    ///
    /// `dynamic` fills the [`HeaderSlot::Dynamic`] positions. Entries with no
    /// slot in the template are appended after the captured headers.
    pub fn ordered_headers(&self, class: RequestClass, dynamic: &HeaderMap) -> HeaderMap {
        let slots = self.header_slots(class);
        let mut headers = HeaderMap::with_capacity(slots.len() + dynamic.len());

        for slot in slots {
            match *slot {
                Fixed(name, value) => {
                    headers.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                Dynamic(name) => {
                    if let Some(value) = dynamic.get(name) {
                        headers.insert(HeaderName::from_static(name), value.clone());
                    }
                }
            }
        }

        for (name, value) in dynamic {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        headers
    }

    /// Build a transport for this profile.
    ///
    /// No default headers are installed; every request carries its own
    /// ordered map from [`Self::ordered_headers`].
    pub fn build_client(&self, timeout: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(self.tls.client_config()?)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .zstd(true)
            .http2_initial_stream_window_size(self.http2.initial_window_size)
            .http2_initial_connection_window_size(self.http2.connection_window());

        if let Some(size) = self.http2.max_frame_size {
            builder = builder.http2_max_frame_size(size);
        }

        Ok(builder.build()?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client factory
// ─────────────────────────────────────────────────────────────────────────────

/// One transport per platform, shared by every upstream call.
#[derive(Debug, Clone)]
pub struct HttpClients {
    web: reqwest::Client,
    mobile: reqwest::Client,
}

impl HttpClients {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            web: FIREFOX.build_client(timeout)?,
            mobile: IOS_SAFARI.build_client(timeout)?,
        })
    }

    pub fn client_for(&self, platform: Platform) -> &reqwest::Client {
        match platform {
            Platform::Web => &self.web,
            Platform::Mobile => &self.mobile,
        }
    }

    /// Start a request with the platform's transport and complete header map.
    pub fn request(
        &self,
        platform: Platform,
        class: RequestClass,
        method: reqwest::Method,
        url: &str,
        dynamic: &HeaderMap,
    ) -> reqwest::RequestBuilder {
        let headers = ImpersonationProfile::for_platform(platform).ordered_headers(class, dynamic);
        self.client_for(platform)
            .request(method, url)
            .headers(headers)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};

    use super::*;

    fn names(headers: &HeaderMap) -> Vec<&str> {
        headers.keys().map(|k| k.as_str()).collect()
    }

    #[test]
    fn test_platform_selects_profile() {
        assert_eq!(ImpersonationProfile::for_platform(Platform::Web).name, "firefox");
        assert_eq!(
            ImpersonationProfile::for_platform(Platform::Mobile).name,
            "ios-safari"
        );
    }

    #[test]
    fn test_firefox_api_header_order() {
        let mut dynamic = HeaderMap::new();
        dynamic.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));

        let headers = FIREFOX.ordered_headers(RequestClass::Api, &dynamic);
        assert_eq!(
            names(&headers),
            vec![
                "user-agent",
                "accept",
                "accept-language",
                "accept-encoding",
                "referer",
                "x-amzn-trace-id",
                "authorization",
                "origin",
                "dnt",
                "sec-gpc",
                "connection",
                "sec-fetch-dest",
                "sec-fetch-mode",
                "sec-fetch-site",
            ]
        );
        assert_eq!(headers["x-amzn-trace-id"], "tado=webapp-release/v3835");
        assert_eq!(headers["authorization"], "Bearer abc");
    }

    #[test]
    fn test_dynamic_slots_are_skipped_when_absent() {
        let headers = IOS_SAFARI.ordered_headers(RequestClass::Token, &HeaderMap::new());
        assert_eq!(
            names(&headers),
            vec!["accept", "accept-language", "accept-encoding", "user-agent", "priority"]
        );
        assert_eq!(headers["user-agent"], IOS_APP_USER_AGENT);
    }

    #[test]
    fn test_ios_auth_places_cookie_last() {
        let mut dynamic = HeaderMap::new();
        dynamic.insert(COOKIE, HeaderValue::from_static("session=1"));
        dynamic.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let headers = IOS_SAFARI.ordered_headers(RequestClass::Auth, &dynamic);
        let order = names(&headers);
        assert_eq!(order[1], "content-type");
        assert_eq!(order.last(), Some(&"cookie"));
    }

    #[test]
    fn test_unslotted_dynamic_headers_are_appended() {
        let mut dynamic = HeaderMap::new();
        dynamic.insert("x-extra", HeaderValue::from_static("1"));
        dynamic.insert("accept", HeaderValue::from_static("text/plain"));

        let headers = IOS_SAFARI.ordered_headers(RequestClass::Api, &dynamic);
        assert_eq!(names(&headers).last(), Some(&"x-extra"));
        // Captured values win over caller-supplied duplicates.
        assert_eq!(headers["accept"], JSON_ACCEPT);
    }

    #[test]
    fn test_http2_fingerprints() {
        assert_eq!(FIREFOX.http2.connection_window(), 12_582_912);
        assert_eq!(FIREFOX.http2.priority_frames.len(), 6);
        assert_eq!(FIREFOX.http2.header_priority.depends_on, 13);
        assert_eq!(FIREFOX.http2.header_priority.weight, 41);
        assert_eq!(
            IOS_SAFARI.http2.pseudo_header_order,
            &[":method", ":scheme", ":path", ":authority"]
        );
        assert_eq!(IOS_SAFARI.http2.max_concurrent_streams, Some(100));
        assert_eq!(IOS_SAFARI.http2.header_priority.weight, 254);
    }

    #[test]
    fn test_cipher_suite_order() {
        let firefox = TlsFingerprint::Firefox.cipher_suites();
        let safari = TlsFingerprint::Safari.cipher_suites();
        assert_eq!(firefox.len(), 9);
        assert_eq!(firefox[0].suite(), safari[0].suite());
        assert_eq!(
            firefox[1].suite(),
            rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
        );
        assert_eq!(safari[1].suite(), rustls::CipherSuite::TLS13_AES_256_GCM_SHA384);
    }

    #[test]
    fn test_clients_build() {
        let clients = HttpClients::new().unwrap();
        let _ = clients.client_for(Platform::Web);
        let _ = clients.client_for(Platform::Mobile);
    }
}
