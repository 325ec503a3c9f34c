//! Broadcaster against real node inboxes: contents, retry and isolation.

use crate::*;

use pki_core::{Endpoint, SnapshotKind};
use pki_services::NodeRegistry;

async fn registry_with(nodes: &[&TestNode]) -> Result<NodeRegistry> {
    let registry = NodeRegistry::new();
    for node in nodes {
        let endpoint = Endpoint::try_from(node.message())?;
        assert_eq!(registry.register(endpoint).await, RegistrationStatus::Accepted);
    }
    Ok(registry)
}

#[tokio::test]
async fn client_set_lists_only_clients() -> Result<()> {
    let mut a = TestNode::spawn("client-b", Category::Client).await?;
    let mut b = TestNode::spawn("client-a", Category::Client).await?;
    let mut mix = TestNode::spawn("mix-a", Category::Mix).await?;
    let registry = registry_with(&[&a, &b, &mix]).await?;

    let report = Broadcaster::new(fast_policy())
        .broadcast(&registry, SnapshotKind::ClientSet)
        .await;
    assert_eq!(report.delivered, ["client-a", "client-b", "mix-a"]);
    assert!(report.failed.is_empty());

    for node in [&mut a, &mut b, &mut mix] {
        let announcement = node.next_announcement(5).await?;
        assert_eq!(announcement.kind(), SnapshotKind::ClientSet);
        assert_eq!(names(&announcement), ["client-a", "client-b"]);
    }

    assert!(a.try_announcement().is_none(), "one delivery per broadcast");
    Ok(())
}

#[tokio::test]
async fn announced_fields_match_registration() -> Result<()> {
    let mut mix = TestNode::spawn("mix-0001", Category::Mix).await?;
    let registry = registry_with(&[&mix]).await?;

    Broadcaster::new(fast_policy())
        .broadcast(&registry, SnapshotKind::MixSet)
        .await;

    let announcement = mix.next_announcement(5).await?;
    let [entry] = announcement.nodes() else {
        anyhow::bail!("expected exactly one node, got {announcement:?}");
    };
    assert_eq!(entry.name, "mix-0001");
    assert_eq!(entry.public_addr, "mix-0001.eval:33000");
    assert_eq!(entry.public_key, mix.public_key);
    assert_eq!(entry.public_cert_pem, mix.identity.cert_pem.as_bytes());
    Ok(())
}

#[tokio::test]
async fn empty_mix_set_is_bare_tag() -> Result<()> {
    let mut client = TestNode::spawn("client-0001", Category::Client).await?;
    let registry = registry_with(&[&client]).await?;

    Broadcaster::new(fast_policy())
        .broadcast(&registry, SnapshotKind::MixSet)
        .await;

    let announcement = client.next_announcement(5).await?;
    assert_eq!(announcement, Announcement::Mixes(Vec::new()));
    Ok(())
}

#[tokio::test]
async fn late_inbox_reached_by_retry() -> Result<()> {
    let identity = Identity::generate();

    // Reserve a port, then release it so the first dials are refused.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0")?;
    let contact_addr = reserved.local_addr()?.to_string();
    drop(reserved);

    let registry = NodeRegistry::new();
    let endpoint = Endpoint::try_from(RegistrationMessage {
        category: Category::Mix as u8,
        name: "mix-late".to_string(),
        public_addr: "mix-late.eval:33000".to_string(),
        public_key: hex::encode([7u8; 32]),
        public_cert: identity.cert_pem.clone(),
        contact_addr: contact_addr.clone(),
        contact_cert: identity.cert_pem.clone(),
    })?;
    registry.register(endpoint).await;

    let bind_later = {
        let identity = identity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let inbox = BroadcastInbox::bind(&contact_addr, identity.credentials()).await?;
            inbox.recv().await
        })
    };

    let report = Broadcaster::new(fast_policy())
        .broadcast(&registry, SnapshotKind::EpochRotate)
        .await;
    assert_eq!(report.delivered, ["mix-late"]);
    assert_eq!(bind_later.await??, Announcement::EpochRotate);
    Ok(())
}

#[tokio::test]
async fn dead_node_does_not_block_others() -> Result<()> {
    let mut alive = TestNode::spawn("client-alive", Category::Client).await?;
    let dead = TestNode::spawn("client-dead", Category::Client).await?;
    let mut msg = dead.message();
    msg.contact_addr = "127.0.0.1:1".to_string();

    let registry = registry_with(&[&alive]).await?;
    registry.register(Endpoint::try_from(msg)?).await;

    let policy = RetryPolicy {
        max_attempts: 3,
        retry_delay: Duration::from_millis(10),
        dial_timeout: Duration::from_millis(200),
    };
    let report = Broadcaster::new(policy)
        .broadcast(&registry, SnapshotKind::ClientSet)
        .await;

    assert_eq!(report.delivered, ["client-alive"]);
    assert_eq!(report.failed, ["client-dead"]);
    let announcement = alive.next_announcement(5).await?;
    assert_eq!(names(&announcement), ["client-alive", "client-dead"]);
    Ok(())
}

#[tokio::test]
async fn mismatched_contact_cert_is_not_trusted() -> Result<()> {
    let mut honest = TestNode::spawn("mix-honest", Category::Mix).await?;
    let mut spoofed = TestNode::spawn("mix-spoofed", Category::Mix).await?;

    // Registered cert belongs to someone else; the inbox presents its own.
    let mut msg = spoofed.message();
    msg.contact_cert = Identity::generate().cert_pem;

    let registry = registry_with(&[&honest]).await?;
    registry.register(Endpoint::try_from(msg)?).await;

    let policy = RetryPolicy {
        max_attempts: 2,
        retry_delay: Duration::from_millis(10),
        dial_timeout: Duration::from_millis(500),
    };
    let report = Broadcaster::new(policy)
        .broadcast(&registry, SnapshotKind::MixSet)
        .await;

    assert_eq!(report.delivered, ["mix-honest"]);
    assert_eq!(report.failed, ["mix-spoofed"]);
    assert_eq!(honest.next_announcement(5).await?.kind(), SnapshotKind::MixSet);
    assert!(spoofed.try_announcement().is_none());
    Ok(())
}
