//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use asap_core::{ChannelMeta, Era, Format, Hop, Medium, PeerId};
use asap_sync::{AssimilateHeader, Framing, Interest};

/// Generate any era, including the ones next to the wrap-around.
pub fn era() -> impl Strategy<Value = Era> {
    prop_oneof![
        any::<u32>().prop_map(Era),
        (0u32..4).prop_map(Era),
        (0u32..4).prop_map(|d| Era(u32::MAX - d)),
    ]
}

/// Generate a short, non-empty peer id.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    "[a-z][a-z0-9]{0,11}".prop_map(|id| PeerId::new(id).unwrap())
}

/// Generate a format name.
pub fn format() -> impl Strategy<Value = Format> {
    "[a-z]{1,8}".prop_map(|name| Format::new(name).unwrap())
}

/// Generate a channel uri.
pub fn channel_uri() -> impl Strategy<Value = String> {
    "[a-z]{1,6}".prop_map(|path| format!("sn://{}", path))
}

/// Generate a medium.
pub fn medium() -> impl Strategy<Value = Medium> {
    prop_oneof![
        Just(Medium::Unknown),
        Just(Medium::AdHoc),
        Just(Medium::Hub),
        Just(Medium::Internet),
        Just(Medium::Onion),
    ]
}

/// Generate a hop.
pub fn hop() -> impl Strategy<Value = Hop> {
    (peer_id(), medium(), any::<bool>(), any::<bool>())
        .prop_map(|(sender, medium, verified, encrypted)| Hop::new(sender, medium, verified, encrypted))
}

/// Generate open or closed channel metadata.
pub fn channel_meta() -> impl Strategy<Value = ChannelMeta> {
    prop_oneof![
        Just(ChannelMeta::open()),
        prop::collection::vec(peer_id(), 1..4).prop_map(ChannelMeta::closed),
    ]
}

/// Generate 1..=max_count non-empty messages.
pub fn messages(max_count: usize) -> impl Strategy<Value = Vec<Bytes>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..=max_count.max(1))
        .prop_map(|messages| messages.into_iter().map(Bytes::from).collect())
}

/// Generate an INTEREST with any combination of optional fields.
pub fn interest() -> impl Strategy<Value = Interest> {
    (
        format(),
        proptest::option::of(peer_id()),
        proptest::option::of(peer_id()),
        proptest::option::of(channel_uri()),
        proptest::option::of(era()),
        proptest::option::of(era()),
        any::<bool>(),
        proptest::option::of(prop::collection::btree_map(peer_id(), era(), 0..4)),
    )
        .prop_map(
            |(format, sender, recipient, channel, era_from, era_to, routing, encounters)| Interest {
                format,
                sender,
                recipient,
                channel,
                era_from,
                era_to,
                routing,
                encounters,
            },
        )
}

/// Generate an ASSIMILATE header together with the messages it frames.
pub fn assimilate() -> impl Strategy<Value = (AssimilateHeader, Vec<Bytes>)> {
    (
        format(),
        proptest::option::of(peer_id()),
        proptest::option::of(peer_id()),
        channel_uri(),
        era(),
        any::<bool>(),
        prop::collection::vec(hop(), 0..3),
        messages(5),
    )
        .prop_map(|(format, sender, recipient, channel, era, routed, hops, messages)| {
            let header = AssimilateHeader {
                format,
                sender,
                recipient,
                channel,
                era,
                routed,
                hops,
                framing: Framing::of(&messages),
            };
            (header, messages)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_framing_is_valid((header, messages) in assimilate()) {
            prop_assert!(header.framing.validate().is_ok());
            let lengths: Vec<u64> = messages.iter().map(|m| m.len() as u64).collect();
            prop_assert_eq!(header.framing.message_lengths(), lengths);
        }

        #[test]
        fn generated_eras_cycle(e in era()) {
            prop_assert_eq!(e.next().previous(), e);
        }
    }
}
