//! Proptest strategies for property-based testing.

use proptest::prelude::*;

use meshsync_core::{limits, Contact, HopId, Keypair, MessageId, NodeUid};

/// Generate a deterministic keypair from a random seed.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random node uid.
pub fn node_uid() -> impl Strategy<Value = NodeUid> {
    any::<[u8; 8]>().prop_map(NodeUid::from_bytes)
}

/// Generate a random message id.
pub fn message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 8]>().prop_map(MessageId::from_bytes)
}

/// Generate a random hop fingerprint.
pub fn hop_id() -> impl Strategy<Value = HopId> {
    any::<[u8; 4]>().prop_map(HopId::from_bytes)
}

/// Generate a contact on a private v4 subnet.
pub fn contact() -> impl Strategy<Value = Contact> {
    (any::<u8>(), any::<u8>(), 1024u16..).prop_map(|(a, b, port)| {
        Contact::from_address(format!("10.{a}.{b}.1:{port}"))
    })
}

/// Generate message content within the size limit.
pub fn content() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..=limits::MAX_MESSAGE_SIZE)
}

/// Generate a well-formed provenance chain: whole 4-byte hops, within the
/// history cap.
pub fn history() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<[u8; 4]>(), 0..limits::MAX_HISTORY_LEN / 4)
        .prop_map(|hops| hops.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{extend_history, history_hops};

    proptest! {
        #[test]
        fn signatures_verify_for_any_inputs(
            keypair in keypair(),
            uid in node_uid(),
            id in message_id(),
            content in content(),
        ) {
            let signature = keypair.sign_message(&uid, &id, &content, None);
            prop_assert!(keypair
                .public_key()
                .verify_message(&uid, &id, &content, None, &signature)
                .is_ok());
        }

        #[test]
        fn tampered_content_fails_verification(
            keypair in keypair(),
            uid in node_uid(),
            id in message_id(),
            content in content(),
        ) {
            let signature = keypair.sign_message(&uid, &id, &content, None);
            let mut tampered = content.clone();
            tampered.push(0);
            prop_assert!(keypair
                .public_key()
                .verify_message(&uid, &id, &tampered, None, &signature)
                .is_err());
        }

        #[test]
        fn extended_history_stays_bounded(history in history(), hop in hop_id()) {
            let extended = extend_history(&history, hop);
            prop_assert!(extended.len() <= limits::MAX_HISTORY_LEN);
            prop_assert_eq!(history_hops(&extended).next(), Some(hop));
        }

        #[test]
        fn history_parses_whole_hops(history in history()) {
            prop_assert_eq!(
                history_hops(&history).count(),
                history.len() / 4
            );
        }
    }
}
