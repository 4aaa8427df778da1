use once_cell::sync::Lazy;

pub mod codec;
pub mod constraint;
pub mod error;
pub mod protocol;
pub mod widget;

pub static APP_NAME: &str = "livecell";
pub static APP_FRONT_NAME: &str = "livecell-front";

/// default debounce window for bursty discrete input (typed characters)
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;
/// default minimum interval between optimistic updates while dragging
pub const DEFAULT_THROTTLE_MS: u64 = 100;
/// default TTL of the persistence read cache
pub const DEFAULT_CACHE_TTL_SEC: u64 = 5 * 60;

pub static LOG_FORMAT_JSON: Lazy<bool> = Lazy::new(|| {
    std::env::var("LOG_FORMAT")
        .map(|s| s.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
});
