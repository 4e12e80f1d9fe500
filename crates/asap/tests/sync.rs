//! End-to-end synchronization between peers over in-process connections.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use asap::sync::codec;
use asap::sync::{AssimilateHeader, Framing, Pdu};
use asap::{ChannelMeta, Era, Format, Hop, Medium, NoCrypto, Peer, PeerConfig};
use asap_testkit::fixtures::DUPLEX_BUFFER;
use asap_testkit::{connect, disconnect, eventually, init_tracing, memory_peer, peer_id, RecordingChunks};

const GENERAL: &str = "sn://chat/general";

fn chat() -> Format {
    Format::new("chat").unwrap()
}

/// Peers may meet again right away.
fn config() -> PeerConfig {
    let mut config = PeerConfig::default();
    config.encounter.cool_down = Duration::ZERO;
    config
}

#[tokio::test]
async fn test_end_to_end_one_hop() {
    init_tracing();
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;
    let events = Arc::new(RecordingChunks::default());
    bob.add_chunk_listener(events.clone());

    alice.append(&chat(), GENERAL, b"hello bob").await.unwrap();
    let sessions = connect(&alice, &bob).await;

    eventually(|| async { !events.events().is_empty() }).await;
    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"hello bob")]);

    let event = &events.events()[0];
    assert_eq!(event.sender, peer_id("alice"));
    assert_eq!(event.era, Era(0));
    assert_eq!(event.hops, vec![Hop::new(peer_id("alice"), Medium::Unknown, false, false)]);

    // The encounter closed alice's era.
    let engine = alice.engine(&chat()).unwrap();
    assert_eq!(engine.lock().await.era(), Era(1));

    disconnect(sessions).await;
}

#[tokio::test]
async fn test_end_to_end_with_sqlite_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut alice_config = config();
    alice_config.data_dir = Some(dir.path().join("alice"));
    let mut bob_config = config();
    bob_config.data_dir = Some(dir.path().join("bob"));

    let alice = Peer::new(peer_id("alice"), alice_config);
    alice.add_format(chat()).await.unwrap();
    let bob = Peer::new(peer_id("bob"), bob_config);
    bob.add_format(chat()).await.unwrap();

    alice.append(&chat(), GENERAL, b"durable").await.unwrap();
    let sessions = connect(&alice, &bob).await;

    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;
}

#[tokio::test]
async fn test_closed_channel_reaches_only_its_recipients() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;

    alice
        .create_channel(&chat(), "sn://chat/carol", ChannelMeta::closed([peer_id("carol")]))
        .await
        .unwrap();
    alice.append(&chat(), "sn://chat/carol", b"for carol only").await.unwrap();
    alice.append(&chat(), GENERAL, b"for everyone").await.unwrap();

    let sessions = connect(&alice, &bob).await;
    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;

    let private = bob.received(&chat(), &peer_id("alice"), "sn://chat/carol").await.unwrap();
    assert!(private.is_empty());
    disconnect(sessions).await;
}

#[tokio::test]
async fn test_chunk_arriving_over_second_route_is_dropped() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;
    let carol = memory_peer("carol", "chat", config()).await;
    let events = Arc::new(RecordingChunks::default());
    bob.add_chunk_listener(events.clone());

    alice.append(&chat(), GENERAL, b"once").await.unwrap();

    // alice -> carol, then alice -> bob directly.
    let sessions = connect(&alice, &carol).await;
    eventually(|| async {
        !carol.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;

    let sessions = connect(&alice, &bob).await;
    eventually(|| async { events.events().len() == 1 }).await;
    disconnect(sessions).await;

    // carol routes the same chunk to bob, who already has it, right after
    // her own content.
    carol.append(&chat(), "sn://chat/carol", b"from carol").await.unwrap();
    let sessions = connect(&carol, &bob).await;
    eventually(|| async {
        !bob.received(&chat(), &peer_id("carol"), "sn://chat/carol").await.unwrap().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    disconnect(sessions).await;

    let from_alice = events
        .events()
        .iter()
        .filter(|event| event.sender == peer_id("alice"))
        .count();
    assert_eq!(from_alice, 1);
    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"once")]);
}

#[tokio::test]
async fn test_own_chunk_echoed_back_is_ignored() {
    let alice = memory_peer("alice", "chat", config()).await;

    let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
    let (local_reader, local_writer) = tokio::io::split(local);
    let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

    let raw_handshake = async {
        codec::write_peer_id(&mut remote_writer, &peer_id("mallory")).await.unwrap();
        codec::read_peer_id(&mut remote_reader).await.unwrap()
    };
    let (session, seen) = tokio::join!(
        alice.handle_encounter(local_reader, local_writer, "mallory", false),
        raw_handshake
    );
    let session = session.unwrap();
    assert_eq!(seen, peer_id("alice"));

    let send = |sender: &str, uri: &str, body: &'static [u8]| {
        let messages = vec![Bytes::from_static(body)];
        let mut header = AssimilateHeader::new(chat(), uri, Era(7));
        header.sender = Some(peer_id(sender));
        header.routed = true;
        header.framing = Framing::of(&messages);
        (Pdu::Assimilate(header), messages)
    };

    let (pdu, messages) = send("alice", GENERAL, b"echo");
    codec::write_pdu(&mut remote_writer, &pdu, &messages, &NoCrypto).await.unwrap();
    let (pdu, messages) = send("mallory", "sn://marker", b"marker");
    codec::write_pdu(&mut remote_writer, &pdu, &messages, &NoCrypto).await.unwrap();

    eventually(|| async {
        !alice.received(&chat(), &peer_id("mallory"), "sn://marker").await.unwrap().is_empty()
    })
    .await;
    let echoed = alice.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert!(echoed.is_empty());

    session.kill();
    session.terminated().await;
}

#[tokio::test]
async fn test_chunks_are_not_sent_twice() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;
    let events = Arc::new(RecordingChunks::default());
    bob.add_chunk_listener(events.clone());

    alice.append(&chat(), GENERAL, b"first").await.unwrap();
    let sessions = connect(&alice, &bob).await;
    eventually(|| async { events.events().len() == 1 }).await;
    disconnect(sessions).await;

    alice.append(&chat(), GENERAL, b"second").await.unwrap();
    let sessions = connect(&alice, &bob).await;
    eventually(|| async { events.events().len() >= 2 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    disconnect(sessions).await;

    let eras: Vec<Era> = events.events().iter().map(|event| event.era).collect();
    assert_eq!(eras, vec![Era(0), Era(1)]);
    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
}

#[tokio::test]
async fn test_routing_through_intermediate_peer() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;
    let carol = memory_peer("carol", "chat", config()).await;
    let events = Arc::new(RecordingChunks::default());
    carol.add_chunk_listener(events.clone());

    alice.append(&chat(), GENERAL, b"pass it on").await.unwrap();

    let sessions = connect(&alice, &bob).await;
    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;

    let sessions = connect(&bob, &carol).await;
    eventually(|| async { !events.events().is_empty() }).await;
    disconnect(sessions).await;

    let event = &events.events()[0];
    assert_eq!(event.sender, peer_id("alice"));
    let relays: Vec<_> = event.hops.iter().map(|hop| hop.sender.clone()).collect();
    assert_eq!(relays, vec![peer_id("alice"), peer_id("bob")]);

    let received = carol.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"pass it on")]);
}

#[tokio::test]
async fn test_routing_disabled_keeps_third_party_content() {
    let mut carol_config = config();
    carol_config.engine.routing_allowed = false;

    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;
    let carol = memory_peer("carol", "chat", carol_config).await;

    alice.append(&chat(), GENERAL, b"not for carol").await.unwrap();
    let sessions = connect(&alice, &bob).await;
    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;

    bob.append(&chat(), "sn://chat/bob", b"from bob").await.unwrap();
    let sessions = connect(&bob, &carol).await;
    eventually(|| async {
        !carol.received(&chat(), &peer_id("bob"), "sn://chat/bob").await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;

    let routed = carol.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert!(routed.is_empty());
}

#[tokio::test]
async fn test_live_messages_reach_connected_peer() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;

    let sessions = connect(&alice, &bob).await;
    alice.append(&chat(), GENERAL, b"live").await.unwrap();

    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"live")]);
    disconnect(sessions).await;
}

#[tokio::test]
async fn test_live_messages_respect_closed_channels() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;

    alice
        .create_channel(&chat(), "sn://chat/carol", ChannelMeta::closed([peer_id("carol")]))
        .await
        .unwrap();
    let sessions = connect(&alice, &bob).await;
    alice.append(&chat(), "sn://chat/carol", b"secret").await.unwrap();
    alice.append(&chat(), GENERAL, b"public").await.unwrap();

    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    let private = bob.received(&chat(), &peer_id("alice"), "sn://chat/carol").await.unwrap();
    assert!(private.is_empty());
    disconnect(sessions).await;
}

#[tokio::test]
async fn test_every_live_message_of_an_era_arrives() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;

    let sessions = connect(&alice, &bob).await;
    alice.append(&chat(), GENERAL, b"one").await.unwrap();
    alice.append(&chat(), GENERAL, b"two").await.unwrap();
    eventually(|| async {
        bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().len() == 2
    })
    .await;
    disconnect(sessions).await;

    let sessions = connect(&alice, &bob).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    disconnect(sessions).await;

    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
}

#[tokio::test]
async fn test_append_after_session_arrives_with_its_era() {
    let alice = memory_peer("alice", "chat", config()).await;
    let bob = memory_peer("bob", "chat", config()).await;

    let sessions = connect(&alice, &bob).await;
    alice.append(&chat(), GENERAL, b"live").await.unwrap();
    eventually(|| async {
        !bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().is_empty()
    })
    .await;
    disconnect(sessions).await;

    // Same era as the live push; the next encounter completes the chunk.
    alice.append(&chat(), GENERAL, b"offline").await.unwrap();
    let sessions = connect(&alice, &bob).await;
    eventually(|| async {
        bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap().len() == 2
    })
    .await;
    disconnect(sessions).await;

    let received = bob.received(&chat(), &peer_id("alice"), GENERAL).await.unwrap();
    assert_eq!(received, vec![Bytes::from_static(b"live"), Bytes::from_static(b"offline")]);
}

#[tokio::test]
async fn test_bulk_sync_in_both_directions() {
    let mut config = config();
    config.sync.read_timeout = Duration::from_secs(3);
    let alice = memory_peer("alice", "chat", config.clone()).await;
    let bob = memory_peer("bob", "chat", config).await;

    // Each side holds four times what the connection buffers.
    let body = vec![b'x'; DUPLEX_BUFFER / 4];
    for _ in 0..16 {
        alice.append(&chat(), "sn://chat/alice", &body).await.unwrap();
        bob.append(&chat(), "sn://chat/bob", &body).await.unwrap();
    }

    let sessions = connect(&alice, &bob).await;
    eventually(|| async {
        alice.received(&chat(), &peer_id("bob"), "sn://chat/bob").await.unwrap().len() == 16
            && bob.received(&chat(), &peer_id("alice"), "sn://chat/alice").await.unwrap().len() == 16
    })
    .await;
    assert!(!sessions.0.is_terminated());
    assert!(!sessions.1.is_terminated());

    let engine = alice.engine(&chat()).unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(1), engine.lock()).await.is_ok());
    disconnect(sessions).await;
}
