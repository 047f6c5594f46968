//! Well-known wire headers and storage key prefixes

/// Admin-plane authentication header
pub const AUTHORIZATION: &str = "x-tyk-authorization";

/// Emitted on GET of a version-child API, carrying the owning base's ID
pub const BASE_API_ID: &str = "x-tyk-base-api-id";

/// Marks a request for the in-memory internal loop regardless of scheme
pub const INTERNAL_API: &str = "x-tyk-internal-api";

/// OAS vendor extension key carrying gateway-specific fields
pub const TYK_EXTENSION: &str = "x-tyk-api-gateway";

/// Reserved URL scheme for internal-loop targets
pub const INTERNAL_SCHEME: &str = "tyk";

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Quota counters live under this prefix, keyed by hashed key
pub const QUOTA_KEY_PREFIX: &str = "quota-";

/// Rate-limit counters live under this prefix
pub const RATE_LIMIT_KEY_PREFIX: &str = "rate-limit-";

/// OAuth clients live under this per-API prefix
pub const OAUTH_CLIENT_PREFIX: &str = "oauth-clients/";

/// Sorted set of issued tokens per client, scored by expiry
pub const OAUTH_CLIENT_TOKENS_PREFIX: &str = "oauth-client-tokens.";

/// Cached upstream responses live under this prefix, keyed by API ID
pub const CACHE_KEY_PREFIX: &str = "cache-";

/// Hop-by-hop headers, removed when forwarding in either direction.
/// `Te` survives when its value is exactly `trailers`.
pub const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Storage prefix for the OAuth manager of a given API.
pub fn oauth_prefix(api_id: &str) -> String {
    format!("oauth-data.{}.", api_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_headers_lowercase() {
        for h in HOP_HEADERS {
            assert_eq!(*h, h.to_lowercase());
        }
    }

    #[test]
    fn test_oauth_prefix() {
        assert_eq!(oauth_prefix("abc"), "oauth-data.abc.");
    }
}
