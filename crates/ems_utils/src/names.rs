//! Topic and channel name validation.
//!
//! Names are limited to 64 characters from `[.a-zA-Z0-9_-]`, with an
//! optional `#ephemeral` suffix marking the topic or channel as
//! memory-only.

use once_cell::sync::Lazy;
use regex::Regex;

static VALID_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[.a-zA-Z0-9_-]+(#ephemeral)?$").unwrap());

fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    VALID_NAME.is_match(name)
}

pub fn is_valid_topic_name(name: &str) -> bool {
    is_valid_name(name)
}

pub fn is_valid_channel_name(name: &str) -> bool {
    is_valid_name(name)
}

/// Whether the name carries the `#ephemeral` suffix.
pub fn is_ephemeral(name: &str) -> bool {
    name.ends_with("#ephemeral")
}
