//! Rate limit decisions and the headers derived from them.

use serde::Serialize;

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status for a rejected request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// The outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The quota this request was evaluated against
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the quota next resets, in Unix milliseconds
    pub reset_at_ms: u64,
    /// Seconds until a retry could be admitted; set only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Build a decision from a post-increment count.
    ///
    /// `retry_at_ms` is the earliest instant at which a retry could succeed;
    /// it is only consulted when the request is denied.
    pub(crate) fn from_count(
        count: u64,
        limit: u64,
        now_ms: u64,
        reset_at_ms: u64,
        retry_at_ms: u64,
    ) -> Self {
        let allowed = count <= limit;
        let retry_after_secs = if allowed {
            None
        } else {
            Some(retry_at_ms.saturating_sub(now_ms).div_ceil(1000))
        };

        Self {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at_ms,
            retry_after_secs,
        }
    }

    /// The reset instant in whole Unix seconds, rounded up.
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// The rate limit headers for this decision.
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at_secs(),
            retry_after: self.retry_after_secs,
        }
    }
}

/// The header set a caller attaches to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds
    pub reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name/value pairs, `Retry-After` last and only when present.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

/// What the HTTP layer sends back for a denied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub status: u16,
    pub message: String,
    pub headers: RateLimitHeaders,
}
