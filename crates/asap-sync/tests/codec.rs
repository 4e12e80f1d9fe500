//! Wire round trips over generated PDUs.

use bytes::Bytes;
use proptest::prelude::*;

use asap_core::{Crypto, Ed25519Crypto, Keypair, NoCrypto, PeerId};
use asap_sync::codec::{read_pdu, write_pdu, Payload};
use asap_sync::{Inbound, Pdu};
use asap_testkit::generators;

const MAX: u64 = 1 << 20;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

/// Write `pdu` and read it back, returning the header, the messages split
/// by its framing, and whatever followed on the stream.
async fn round_trip(pdu: &Pdu, payload: &[Bytes], crypto: &dyn Crypto) -> (Inbound, Vec<Bytes>, Vec<u8>) {
    let mut wire = Vec::new();
    write_pdu(&mut wire, pdu, payload, crypto).await.unwrap();

    let mut reader: &[u8] = &wire;
    let inbound = read_pdu(&mut reader, MAX).await.unwrap();
    let mut messages = Vec::new();
    if let Pdu::Assimilate(header) = &inbound.pdu {
        let mut payload = Payload::new(&mut reader, header.framing.payload_len);
        for len in header.framing.message_lengths() {
            messages.push(payload.read_message(len).await.unwrap());
        }
        assert_eq!(payload.remaining(), 0);
    }
    (inbound, messages, reader.to_vec())
}

proptest! {
    #[test]
    fn interest_decodes_to_what_was_encoded(interest in generators::interest()) {
        let pdu = Pdu::Interest(interest);
        let (inbound, messages, rest) = runtime().block_on(round_trip(&pdu, &[], &NoCrypto));
        prop_assert_eq!(inbound.pdu, pdu);
        prop_assert!(inbound.signature.is_none());
        prop_assert!(messages.is_empty());
        prop_assert!(rest.is_empty());
    }

    #[test]
    fn assimilate_decodes_to_what_was_encoded((header, payload) in generators::assimilate()) {
        let pdu = Pdu::Assimilate(header);
        let (inbound, messages, rest) = runtime().block_on(round_trip(&pdu, &payload, &NoCrypto));
        prop_assert_eq!(inbound.pdu, pdu);
        prop_assert_eq!(messages, payload);
        prop_assert!(rest.is_empty());
    }

    #[test]
    fn signed_assimilate_verifies_for_its_signer(
        (header, payload) in generators::assimilate(),
        seed in any::<[u8; 32]>(),
    ) {
        let keypair = Keypair::from_seed(&seed);
        let signer = Ed25519Crypto::new(keypair.clone());
        let verifier = Ed25519Crypto::new(Keypair::generate());
        let alice = PeerId::new("alice").unwrap();
        verifier.trust(alice.clone(), &keypair);

        let pdu = Pdu::Assimilate(header);
        let (inbound, messages, rest) = runtime().block_on(round_trip(&pdu, &payload, &signer));
        prop_assert_eq!(&inbound.pdu, &pdu);
        prop_assert_eq!(messages, payload);
        prop_assert!(rest.is_empty());

        let signature = inbound.signature.unwrap();
        prop_assert!(verifier.verify(&alice, &signature.covered, &signature.bytes));
        prop_assert!(!verifier.verify(&PeerId::new("mallory").unwrap(), &signature.covered, &signature.bytes));
    }
}
