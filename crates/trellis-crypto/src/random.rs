//! Secure random identifier generation.

use rand_core::{OsRng, RngCore};

/// Generate `N` random bytes from the OS CSPRNG.
///
/// Used for session identifiers and other unguessable tokens.
#[must_use]
pub fn random_id<const N: usize>() -> [u8; N] {
    let mut id = [0u8; N];
    OsRng.fill_bytes(&mut id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a: [u8; 32] = random_id();
        let b: [u8; 32] = random_id();
        assert_ne!(a, b);
    }
}
