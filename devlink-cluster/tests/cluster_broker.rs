// Multi-node scenarios: several brokers sharing one in-process bus behave
// like cluster members on a common Redis.

use devlink_cluster::broker::topics;
use devlink_cluster::{
    BroadcastMessage, BrokerConfig, DeviceMessage, DeviceMessageReply, DeviceOperationBroker,
    DeviceState, DeviceStateInfo, Error, LocalBus, StateChecker, TopicBus,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn node(bus: &Arc<LocalBus>, server_id: &str) -> Arc<DeviceOperationBroker> {
    let bus: Arc<dyn TopicBus> = bus.clone();
    Arc::new(
        DeviceOperationBroker::new(bus, &BrokerConfig::for_server(server_id))
            .await
            .unwrap(),
    )
}

/// Devices whose id ends in an even digit are online
fn parity_checker() -> Arc<dyn StateChecker> {
    Arc::new(|ids: Vec<String>| {
        futures::stream::iter(
            ids.into_iter()
                .map(|id| {
                    let even = id
                        .chars()
                        .last()
                        .and_then(|c| c.to_digit(10))
                        .is_some_and(|d| d % 2 == 0);
                    let state = if even {
                        DeviceState::Online
                    } else {
                        DeviceState::Offline
                    };
                    DeviceStateInfo::new(id, state)
                })
                .collect::<Vec<_>>(),
        )
        .boxed()
    })
}

#[tokio::test]
async fn test_command_and_reply_across_nodes() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;

    // B's device layer answers every command it receives
    let mut inbound = b.handle_send_to_device_message("B").await.unwrap();
    let device_layer = tokio::spawn({
        let b = b.clone();
        async move {
            let command = inbound.next().await.unwrap();
            assert_eq!(command.headers.send_from(), Some("A"));
            let reply = DeviceMessageReply::for_message(&command).with_payload(json!({ "ok": true }));
            assert!(b.reply(reply).await);
        }
    });

    let mut replies = a.handle_reply("M1", Duration::from_secs(5));
    let command = DeviceMessage::new("dev-1", json!({ "function": "reboot" })).with_message_id("M1");
    assert_eq!(a.send("B", vec![command]).await, 1);

    let reply = replies.next().await.unwrap().unwrap();
    assert_eq!(reply.message_id, "M1");
    assert_eq!(reply.headers.reply_from(), Some("B"));
    assert_eq!(reply.payload["ok"], true);
    assert!(replies.next().await.is_none());
    assert!(!a.has_reply_waiter("M1"));

    device_layer.await.unwrap();
}

#[tokio::test]
async fn test_device_failure_is_an_ordinary_reply() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;

    let mut replies = a.handle_reply("M3", Duration::from_secs(5));
    let failure = DeviceMessageReply::new("M3", "dev-7").with_error("DEVICE_OFFLINE", "device is offline");
    assert!(b.reply(failure).await);

    let reply = replies.next().await.unwrap().unwrap();
    assert!(!reply.success);
    assert_eq!(reply.code.as_deref(), Some("DEVICE_OFFLINE"));
    assert_eq!(reply.message.as_deref(), Some("device is offline"));
    assert!(replies.next().await.is_none());
}

#[tokio::test]
async fn test_fragmented_reply_completes_once() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;

    let mut replies = a.handle_reply("M1", Duration::from_secs(5));

    let first = DeviceMessageReply::new("M1-1", "dev-1").with_fragment("M1", 2, false);
    let second = DeviceMessageReply::new("M1-2", "dev-1").with_fragment("M1", 2, true);
    assert!(b.reply(first).await);
    assert!(b.reply(second).await);

    let ids: Vec<String> = replies
        .by_ref()
        .map(|item| item.unwrap().message_id)
        .collect()
        .await;
    assert_eq!(ids, vec!["M1-1".to_string(), "M1-2".to_string()]);
    assert_eq!(a.pending_replies(), 0);
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;
    let _inbound = b.handle_send_to_device_message("B").await.unwrap();

    let mut replies = a.handle_reply("M2", Duration::from_millis(50));
    let command = DeviceMessage::new("dev-1", json!({})).with_message_id("M2");
    assert_eq!(a.send("B", vec![command]).await, 1);

    assert!(matches!(replies.next().await, Some(Err(Error::TimedOut(_)))));
    assert!(!a.has_reply_waiter("M2"));
}

#[tokio::test]
async fn test_send_to_unowned_server_fails_fast() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;

    let command = DeviceMessage::new("dev-1", json!({}));
    assert_eq!(a.send("nobody", vec![command]).await, 0);
}

#[tokio::test]
async fn test_remote_state_check() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;
    let _handle = b.handle_get_device_state("B", parity_checker()).await.unwrap();

    let states: Vec<_> = a.get_device_state("B", ["d1", "d2"]).collect().await;
    assert_eq!(
        states,
        vec![
            DeviceStateInfo::new("d1", DeviceState::Offline),
            DeviceStateInfo::new("d2", DeviceState::Online),
        ]
    );
    assert_eq!(a.pending_checks(), 0);
}

#[tokio::test]
async fn test_concurrent_checks_never_cross_deliver() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;
    let _handle = b.handle_get_device_state("B", parity_checker()).await.unwrap();

    let first = a.get_device_state("B", ["x1", "x2", "x3"]).collect::<Vec<_>>();
    let second = a.get_device_state("B", ["y4"]).collect::<Vec<_>>();
    let (first, second) = tokio::join!(first, second);

    let first_ids: Vec<_> = first.iter().map(|s| s.device_id.as_str()).collect();
    let second_ids: Vec<_> = second.iter().map(|s| s.device_id.as_str()).collect();
    assert_eq!(first_ids, vec!["x1", "x2", "x3"]);
    assert_eq!(second_ids, vec!["y4"]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_owner_degrades_to_empty() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    // C is subscribed but never answers
    let _silent = bus.subscribe(&topics::checker("C")).await.unwrap();

    let states: Vec<_> = a.get_device_state("C", ["d1"]).collect().await;
    assert!(states.is_empty());
    assert_eq!(a.pending_checks(), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_node() {
    let bus = Arc::new(LocalBus::new());
    let a = node(&bus, "A").await;
    let b = node(&bus, "B").await;
    let c = node(&bus, "C").await;

    let mut on_b = b.handle_broadcast().await.unwrap();
    let mut on_c = c.handle_broadcast().await.unwrap();

    let delivered = a
        .broadcast(vec![BroadcastMessage::new(json!({ "event": "maintenance" }))])
        .await;
    assert_eq!(delivered, 2);
    assert_eq!(on_b.next().await.unwrap().payload["event"], "maintenance");
    assert_eq!(on_c.next().await.unwrap().payload["event"], "maintenance");
}
