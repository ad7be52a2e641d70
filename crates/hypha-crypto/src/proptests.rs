#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use crate::identity::{verify_signature, NodeIdentity};

    proptest! {
        #[test]
        fn test_identity_derivation_determinism(seed in any::<[u8; 32]>()) {
            let a = NodeIdentity::derive(&seed).unwrap();
            let b = NodeIdentity::derive(&seed).unwrap();
            prop_assert_eq!(a.node_id(), b.node_id());
        }

        #[test]
        fn test_identity_signature_round_trip(
            seed in any::<[u8; 32]>(),
            message in any::<Vec<u8>>()
        ) {
            let identity = NodeIdentity::derive(&seed).unwrap();
            let sig = identity.sign(&message);
            prop_assert!(verify_signature(&identity.public_key(), &message, &sig).is_ok());
        }

        // Flipping any single bit of the signature must break verification.
        #[test]
        fn test_signature_bit_flip_rejected(
            seed in any::<[u8; 32]>(),
            bit in 0usize..512
        ) {
            let identity = NodeIdentity::derive(&seed).unwrap();
            let mut sig = identity.sign(b"hypha");
            sig[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(verify_signature(&identity.public_key(), b"hypha", &sig).is_err());
        }

        #[test]
        fn test_seed_length_enforced(seed in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(seed.len() != 32);
            prop_assert!(NodeIdentity::derive(&seed).is_err());
        }
    }
}
