//! Property tests for authenticated sealing.

use proptest::prelude::*;
use rand_core::OsRng;
use trellis_crypto::SessionPrivate;

proptest! {
    /// Seal then open is identity for any plaintext, under the pairwise
    /// shared key computed from either side.
    #[test]
    fn seal_open_identity(plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
        let a = SessionPrivate::generate(&mut OsRng);
        let b = SessionPrivate::generate(&mut OsRng);

        let sealed = a.shared(&b.public()).unwrap().seal(&plaintext);
        let opened = b.shared(&a.public()).unwrap().open(&sealed).unwrap();
        prop_assert_eq!(opened, plaintext);
    }

    /// Flipping any single byte breaks authentication.
    #[test]
    fn tamper_fails(
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        flip_bit in 0u8..8,
        pos_seed in any::<usize>(),
    ) {
        let a = SessionPrivate::generate(&mut OsRng);
        let b = SessionPrivate::generate(&mut OsRng);
        let key_ab = a.shared(&b.public()).unwrap();
        let key_ba = b.shared(&a.public()).unwrap();

        let mut sealed = key_ab.seal(&plaintext);
        let pos = pos_seed % sealed.len();
        sealed[pos] ^= 1 << flip_bit;

        prop_assert!(key_ba.open(&sealed).is_err());
    }
}
