//! Room link rules: public link validation, private link generation and
//! direct link derivation.

use rand::distr::{Alphanumeric, SampleString};

/// Length of server-generated private links.
pub const PRIVATE_LINK_LEN: usize = 13;

/// Cap on private link regeneration after collisions.
pub const PRIVATE_LINK_ATTEMPTS: usize = 64;

/// Prefix of every derived direct-room link.
pub const DIRECT_LINK_PREFIX: &str = "link_";

/// Public links may only use ASCII letters, digits and underscore, and may not
/// claim the direct-room namespace.
pub fn is_valid_public_link(link: &str) -> bool {
    !link.is_empty()
        && !link.starts_with(DIRECT_LINK_PREFIX)
        && link.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn random_private_link() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), PRIVATE_LINK_LEN)
}

/// `link_<a>_<b>` with the two usernames in sorted order, so both
/// participants derive the same room.
pub fn direct_link(username_a: &str, username_b: &str) -> String {
    let mut names = [username_a, username_b];
    names.sort_unstable();
    format!("{DIRECT_LINK_PREFIX}{}", names.join("_"))
}
