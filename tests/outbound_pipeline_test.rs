use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wechat_bridge::error::BridgeError;
use wechat_bridge::formatter::LocalContent;
use wechat_bridge::http::{HttpClient, HttpRequest, HttpResponse};
use wechat_bridge::local::MessageStatus;
use wechat_bridge::portal::LocalMessage;
use wechat_bridge::store::MemoryStore;
use wechat_bridge::test_utils::{
    FailingMockHttpClient, MockTransportFactory, RecordingLocalChat, TestBridge, empty_replies,
    test_config,
};
use wechat_bridge::wxcore::{RemoteMessage, WechatUser};
use wechat_bridge::{Bridge, BridgeContext, Client};

fn local_message(room_id: &str, event_id: &str, sender: &str, body: &str) -> LocalMessage {
    LocalMessage {
        room_id: room_id.to_string(),
        event_id: event_id.to_string(),
        sender: sender.to_string(),
        sender_name: None,
        content: LocalContent::text(body),
    }
}

fn body_of(request: &HttpRequest) -> String {
    String::from_utf8(request.body.clone().unwrap_or_default()).unwrap()
}

/// Delivers one message from `chat` so that its room exists, and returns the
/// room id.
async fn bridged_room(bridge: &Arc<Bridge>, chat: &str) -> String {
    let msg = RemoteMessage::text("seed", chat, "userA", "acct1", 1000, "seed");
    bridge.handle_remote_message(&msg).await.unwrap();
    bridge
        .identities()
        .get_portal(&chat.into(), &"acct1".into(), false)
        .await
        .unwrap()
        .unwrap()
        .mxid()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_owner_message_is_sent_to_the_box() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();
    let room = bridged_room(&t.bridge, "room1@chatroom").await;
    t.bridge
        .users()
        .set_user_info("@boss:hs.local", &WechatUser::new("acct1", "Boss"))
        .await
        .unwrap();

    t.bridge
        .handle_local_message(local_message(&room, "$out1", "@boss:hs.local", "hello"))
        .await
        .unwrap();

    let requests = t.http.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert!(requests[0].url.ends_with("/api/sendtxtmsg"));
    let body = body_of(&requests[0]);
    assert!(body.contains("\"para\""));
    assert!(body.contains("hello"));
    assert!(body.contains("room1@chatroom"));

    assert_eq!(
        t.local.statuses(),
        vec![("$out1".to_string(), MessageStatus::Success)]
    );
}

#[tokio::test]
async fn test_blank_message_is_rejected_permanently() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();
    let room = bridged_room(&t.bridge, "room1@chatroom").await;

    let result = t
        .bridge
        .handle_local_message(local_message(&room, "$blank", "@boss:hs.local", "  "))
        .await;
    assert!(matches!(result, Err(BridgeError::IgnoredMessage(_))));
    assert!(t.http.requests().is_empty());
    assert_eq!(
        t.local.statuses(),
        vec![("$blank".to_string(), MessageStatus::Permanent)]
    );

    let (as_user, _, notice) = t.local.messages().pop().unwrap();
    assert_eq!(as_user, "@wechatbot:hs.local");
    assert!(notice.body.contains("not bridged"));
}

#[tokio::test]
async fn test_relay_prefixes_the_sender_and_refuses_strangers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();
    let room = bridged_room(&t.bridge, "room1@chatroom").await;

    let stranger = t
        .bridge
        .handle_local_message(local_message(&room, "$s1", "@friend:hs.local", "hi"))
        .await;
    assert!(
        matches!(&stranger, Err(BridgeError::IgnoredMessage(reason)) if reason == "relaying not supported")
    );

    let portal = t
        .bridge
        .identities()
        .get_portal(&"room1@chatroom".into(), &"acct1".into(), false)
        .await
        .unwrap()
        .unwrap();
    portal
        .update_info(t.bridge.context(), None, Some("@boss:hs.local"))
        .await
        .unwrap();

    t.bridge
        .handle_local_message(local_message(&room, "$r1", "@friend:hs.local", "hi"))
        .await
        .unwrap();
    let requests = t.http.requests();
    assert_eq!(requests.len(), 1);
    assert!(body_of(&requests[0]).contains("friend: hi"));

    let unknown = t
        .bridge
        .handle_local_message(local_message(&room, "$x1", "@x:hs.local", "hi"))
        .await;
    assert!(
        matches!(&unknown, Err(BridgeError::IgnoredMessage(reason)) if reason == "relaying not supported")
    );
    assert_eq!(t.http.requests().len(), 1);
}

#[tokio::test]
async fn test_echoes_and_unbridged_rooms_are_not_sent() {
    let t = TestBridge::new();
    let room = bridged_room(&t.bridge, "room1@chatroom").await;

    t.bridge
        .handle_local_message(local_message(&room, "$e1", "@wechat_user_a:hs.local", "seed"))
        .await
        .unwrap();
    t.bridge
        .handle_local_message(local_message(&room, "$e2", "@wechatbot:hs.local", "notice"))
        .await
        .unwrap();

    let unbridged = t
        .bridge
        .handle_local_message(local_message("!elsewhere:hs.local", "$e3", "@boss:hs.local", "hi"))
        .await;
    assert!(matches!(unbridged, Err(BridgeError::IgnoredMessage(_))));

    assert!(t.http.requests().is_empty());
    assert!(t.local.statuses().is_empty());
}

#[tokio::test]
async fn test_failed_send_is_reported_as_retriable() {
    let config = Arc::new(test_config());
    let factory = Arc::new(MockTransportFactory::with_responder(empty_replies));
    let (client, _events) =
        Client::new(config.wechat.client_config(), factory, Arc::new(FailingMockHttpClient));
    let local = Arc::new(RecordingLocalChat::new());
    let ctx = BridgeContext::new(config, Arc::new(MemoryStore::new()), local.clone(), client);
    let bridge = Bridge::new(ctx);
    let room = bridged_room(&bridge, "room1@chatroom").await;
    bridge
        .users()
        .set_user_info("@boss:hs.local", &WechatUser::new("acct1", "Boss"))
        .await
        .unwrap();

    let result = bridge
        .handle_local_message(local_message(&room, "$f1", "@boss:hs.local", "hello"))
        .await;
    assert!(matches!(result, Err(BridgeError::Client(_))));
    assert_eq!(
        local.statuses(),
        vec![("$f1".to_string(), MessageStatus::Retriable)]
    );
}

/// Box whose HTTP actions take a while and which records when each one ran.
struct SlowHttpClient {
    log: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpClient for SlowHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let body = String::from_utf8(request.body.unwrap_or_default())?;
        let tag = if body.contains("first") { "first" } else { "second" };
        self.log.lock().unwrap().push(format!("start {tag}"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.log.lock().unwrap().push(format!("end {tag}"));
        Ok(HttpResponse {
            status_code: 200,
            body: b"{}".to_vec(),
        })
    }
}

#[tokio::test]
async fn test_sends_from_one_account_do_not_overlap() {
    let _ = env_logger::builder().is_test(true).try_init();
    let slow = Arc::new(SlowHttpClient {
        log: Mutex::new(Vec::new()),
    });
    let config = Arc::new(test_config());
    let factory = Arc::new(MockTransportFactory::with_responder(empty_replies));
    let (client, _events) = Client::new(config.wechat.client_config(), factory, slow.clone());
    let local = Arc::new(RecordingLocalChat::new());
    let ctx = BridgeContext::new(config, Arc::new(MemoryStore::new()), local, client);
    let bridge = Bridge::new(ctx);

    let room1 = bridged_room(&bridge, "room1@chatroom").await;
    let room2 = bridged_room(&bridge, "room2@chatroom").await;
    bridge
        .users()
        .set_user_info("@boss:hs.local", &WechatUser::new("acct1", "Boss"))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        bridge.handle_local_message(local_message(&room1, "$a", "@boss:hs.local", "first")),
        bridge.handle_local_message(local_message(&room2, "$b", "@boss:hs.local", "second")),
    );
    a.unwrap();
    b.unwrap();

    let log = slow.log.lock().unwrap().clone();
    assert_eq!(log.len(), 4);
    let first_tag = log[0].strip_prefix("start ").unwrap();
    assert_eq!(log[1], format!("end {first_tag}"));
    assert!(log[2].starts_with("start "));
    assert!(log[3].starts_with("end "));
}
