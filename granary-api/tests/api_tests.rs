//! Boundary tests over a sim-backed node.

use granary_api::{
    Api, ApiError, FollowBody, MessageQuery, PostBody, ReplyToBody, TimelineQuery, TrustBody,
};
use granary_node::{DataDir, NodeBuilder};
use granary_sim::SimNet;
use std::path::Path;
use std::sync::Arc;

async fn start_api(sim: &Arc<SimNet>, dir: impl AsRef<Path>) -> Api {
    let net = sim.clone();
    let node = NodeBuilder::new(DataDir::new(dir.as_ref()), sim.log_opener())
        .with_overlay(move |identity| net.overlay(identity))
        .start()
        .await
        .unwrap();
    Api::new(Arc::new(node))
}

#[tokio::test]
async fn test_info_and_default_timeline() {
    let sim = SimNet::new();
    let tmp = tempfile::tempdir().unwrap();
    let api = start_api(&sim, tmp.path()).await;

    let info = api.info();
    assert_eq!(info.feed_key.len(), 44);

    api.post(PostBody { content: "first".into(), reply_to: None }).await.unwrap();

    // No feed key in the query means the node's own feed.
    let timeline = api.timeline(TimelineQuery::default()).await.unwrap();
    assert_eq!(timeline.messages.len(), 2);
    assert_eq!(timeline.messages[0].message.kind, "open");
    assert_eq!(timeline.messages[1].message.payload["content"], "first");
}

#[tokio::test]
async fn test_timeline_window_controls() {
    let sim = SimNet::new();
    let tmp = tempfile::tempdir().unwrap();
    let api = start_api(&sim, tmp.path()).await;

    for i in 0..5 {
        api.post(PostBody { content: format!("post {i}"), reply_to: None }).await.unwrap();
    }

    let query = TimelineQuery { feed_key: None, offset: Some(1), limit: Some(2) };
    let timeline = api.timeline(query).await.unwrap();
    let indices: Vec<u64> = timeline.messages.iter().map(|m| m.index).collect();
    assert_eq!(indices, vec![3, 4]);
}

#[tokio::test]
async fn test_invalid_and_missing_keys_are_rejected() {
    let sim = SimNet::new();
    let tmp = tempfile::tempdir().unwrap();
    let api = start_api(&sim, tmp.path()).await;

    let query = TimelineQuery { feed_key: Some("???".into()), ..Default::default() };
    assert!(matches!(api.timeline(query).await, Err(ApiError::InvalidKey(_))));

    let body = FollowBody { feed_key: "c2hvcnQ=".into() };
    assert!(matches!(api.follow(body).await, Err(ApiError::InvalidKey(_))));

    let query = MessageQuery { feed_key: None, index: 99 };
    assert!(matches!(api.message(query).await, Err(ApiError::NotFound(99))));
}

#[tokio::test]
async fn test_trust_then_reply_shows_in_meta() {
    let sim = SimNet::new();
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let a = start_api(&sim, tmp_a.path()).await;
    let b = start_api(&sim, tmp_b.path()).await;

    b.post(PostBody { content: "topic".into(), reply_to: None }).await.unwrap();
    let trust = b
        .trust(TrustBody { feed_key: a.info().feed_key, expires_in: None, description: None })
        .await
        .unwrap();
    // grantee(32) + expiry(8) + signature(64) bytes, hex-encoded.
    assert_eq!(trust.link.len(), 208);

    let reply = ReplyToBody { feed_key: b.info().feed_key.clone(), index: 1 };
    a.post(PostBody { content: "reply".into(), reply_to: Some(reply) }).await.unwrap();

    let query = MessageQuery { feed_key: Some(b.info().feed_key), index: 1 };
    let response = b.message(query).await.unwrap();
    assert_eq!(response.message.meta.len(), 1);
    let json = serde_json::to_value(&response.message.meta[0]).unwrap();
    assert_eq!(json["type"], "reply");
    assert_eq!(json["feed_key"], a.info().feed_key);
    assert_eq!(json["index"], 1);
}
