//! Multi-peer behavior over the in-memory DHT: convergence on the message
//! union, late joiners, read-only channels, and restart persistence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use meshsync::proto::transport::memory::MemoryDhtHub;
use meshsync::{EngineConfig, Keypair, Signature, SyncEngine};
use meshsync_testkit::TestSwarm;

#[tokio::test]
async fn test_three_peers_converge_on_union() {
    let swarm = TestSwarm::new(3, "convergence");
    for (i, engine) in swarm.engines.iter().enumerate() {
        engine
            .send(format!("message {i}").into_bytes(), None, 0, 0)
            .await
            .unwrap();
    }
    assert!(swarm.settle(3, 20).await, "peers failed to converge");

    // identical signature sets everywhere
    let sets: Vec<HashSet<Signature>> = swarm
        .engines
        .iter()
        .map(|e| e.messages().iter().map(|m| *m.signature()).collect())
        .collect();
    assert_eq!(sets[0], sets[1]);
    assert_eq!(sets[1], sets[2]);

    // everyone's own message got delivered somewhere
    for engine in &swarm.engines {
        assert_eq!(engine.counters().undelivered_out, 0);
    }
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let swarm = TestSwarm::new(2, "late-join");
    swarm.engines[0]
        .send(b"early 1".to_vec(), None, 0, 0)
        .await
        .unwrap();
    swarm.engines[1]
        .send(b"early 2".to_vec(), None, 0, 0)
        .await
        .unwrap();
    assert!(swarm.settle(2, 20).await);

    let transport = Arc::new(swarm.hub.attach("10.0.9.9:6881"));
    let late = SyncEngine::new(
        Keypair::generate(),
        transport,
        EngineConfig::for_channel("late-join", b"swarm shared key".to_vec()),
    );
    for round in 1..=20u64 {
        let now = 30_000 + round * 1_000;
        late.tick(now, now as i64).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if late.messages().len() >= 2 {
            break;
        }
    }
    assert_eq!(late.messages().len(), 2);
}

#[tokio::test]
async fn test_backlog_larger_than_reply_budget_converges() {
    let swarm = TestSwarm::new(2, "backlog");
    let content = vec![b'x'; 500];
    // spaced sends keep the rate limiter out of the picture
    for i in 0..12u64 {
        swarm.engines[0]
            .send(content.clone(), None, i * 10_000, (i * 10_000) as i64)
            .await
            .unwrap();
    }
    assert!(swarm.settle(12, 30).await, "backlog never fully transferred");
}

#[tokio::test]
async fn test_read_only_channel_carries_only_owner_posts() {
    let hub = MemoryDhtHub::new();
    let owner_key = Keypair::generate();
    let mut config = EngineConfig::for_channel("announcements", b"k".to_vec());
    config.read_only_owner = Some(owner_key.public_key());

    let owner = SyncEngine::new(
        owner_key,
        Arc::new(hub.attach("10.0.0.1:6881")),
        config.clone(),
    );
    let reader = SyncEngine::new(
        Keypair::generate(),
        Arc::new(hub.attach("10.0.0.2:6881")),
        config,
    );

    owner.send(b"bulletin".to_vec(), None, 0, 0).await.unwrap();
    assert!(reader.send(b"chatter".to_vec(), None, 0, 0).await.is_err());

    for round in 1..=20u64 {
        let now = round * 1_000;
        owner.tick(now, now as i64).await;
        reader.tick(now, now as i64).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !reader.messages().is_empty() {
            break;
        }
    }
    assert_eq!(reader.messages().len(), 1);
    assert_eq!(reader.messages()[0].content(), b"bulletin");
}

#[tokio::test]
async fn test_persistence_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channel.state");
    let hub = MemoryDhtHub::new();
    let mut config = EngineConfig::for_channel("persist", b"k".to_vec());
    config.persist_path = Some(path.clone());

    let engine = SyncEngine::new(
        Keypair::generate(),
        Arc::new(hub.attach("10.0.0.1:6881")),
        config.clone(),
    );
    engine.send(b"durable".to_vec(), None, 0, 0).await.unwrap();
    let wall = engine.wall_ms();
    engine.tick(1_000, wall).await;
    assert!(path.exists());
    drop(engine);

    let revived = SyncEngine::new(
        Keypair::generate(),
        Arc::new(hub.attach("10.0.0.1:6881")),
        config,
    );
    assert_eq!(revived.messages().len(), 1);
    assert_eq!(revived.messages()[0].content(), b"durable");
}
