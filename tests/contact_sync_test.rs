use std::sync::Arc;

use serde_json::{Value, json};
use wechat_bridge::error::BridgeError;
use wechat_bridge::http::HttpResponse;
use wechat_bridge::store::MemoryStore;
use wechat_bridge::test_utils::{
    LocalCall, MockHttpClient, MockTransportFactory, RecordingLocalChat, TestBridge,
    empty_replies, reply, test_config,
};
use wechat_bridge::wxcore::{Contact, RemoteMessage};
use wechat_bridge::{Bridge, BridgeContext, Client};

fn contact_list(request: &Value) -> Vec<String> {
    if request["type"] == json!(5000) {
        vec![reply(
            request,
            json!([
                {"wxid": "room5@chatroom", "name": "Team"},
                {"wxid": "wxid_carol", "name": "Carol", "remarks": ""},
                {"wxid": "", "name": "broken"},
            ]),
        )]
    } else {
        empty_replies(request)
    }
}

#[tokio::test]
async fn test_contact_sync_creates_portals_and_puppets() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new().logged_in("acct1").await;
    t.factory.set_responder(contact_list);

    let synced = t.bridge.sync_contacts().await.unwrap();
    assert_eq!(synced, 2);

    let portal = t
        .bridge
        .identities()
        .get_portal(&"room5@chatroom".into(), &"acct1".into(), false)
        .await
        .unwrap()
        .expect("chatroom should become a portal");
    let record = portal.record().await;
    assert_eq!(record.name.as_deref(), Some("Team"));
    assert_eq!(record.relay_user_id.as_deref(), Some("@boss:hs.local"));
    assert_eq!(record.mxid, None);

    let puppet = t
        .bridge
        .identities()
        .get_puppet(&"wxid_carol".into(), false)
        .await
        .unwrap()
        .expect("account should become a puppet");
    assert_eq!(puppet.display_name().await, "Carol");
    assert!(t.local.calls().contains(&LocalCall::DisplayName {
        user_id: "@wechat_wxid__carol:hs.local".to_string(),
        name: "Carol (WeChat)".to_string(),
    }));

    // A second sync with unchanged contacts pushes nothing new.
    let calls = t.local.calls().len();
    assert_eq!(t.bridge.sync_contacts().await.unwrap(), 2);
    assert_eq!(t.local.calls().len(), calls);
}

#[tokio::test]
async fn test_contact_sync_needs_a_logged_in_account() {
    let t = TestBridge::new();
    let result = t.bridge.sync_contacts().await;
    assert!(matches!(result, Err(BridgeError::NotLoggedIn)));
}

#[tokio::test]
async fn test_avatar_is_uploaded_once_per_change() {
    let _ = env_logger::builder().is_test(true).try_init();
    let http = Arc::new(MockHttpClient::with_handler(|request| {
        if request.url.starts_with("http://img.local/") {
            HttpResponse {
                status_code: 200,
                body: vec![0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10],
            }
        } else {
            HttpResponse {
                status_code: 404,
                body: Vec::new(),
            }
        }
    }));
    let config = Arc::new(test_config());
    let factory = Arc::new(MockTransportFactory::new());
    let (client, _events) = Client::new(config.wechat.client_config(), factory, http.clone());
    let local = Arc::new(RecordingLocalChat::new());
    let ctx = BridgeContext::new(config, Arc::new(MemoryStore::new()), local.clone(), client);
    let bridge = Bridge::new(ctx);

    let puppet = bridge
        .identities()
        .get_puppet(&"wxid_carol".into(), true)
        .await
        .unwrap()
        .unwrap();
    let mut contact = Contact::new("wxid_carol", "Carol");
    contact.headimg = "http://img.local/carol.jpg".to_string();

    assert!(puppet.update_info(bridge.context(), &contact, None).await.unwrap());
    let uploads = |calls: Vec<LocalCall>| {
        calls
            .into_iter()
            .filter(|c| matches!(c, LocalCall::Upload { .. }))
            .count()
    };
    assert_eq!(uploads(local.calls()), 1);
    assert!(local.calls().iter().any(|c| matches!(
        c,
        LocalCall::Upload { mime, .. } if mime == "image/jpeg"
    )));
    let record = puppet.record().await;
    assert!(record.avatar_set);
    assert!(record.avatar_url.unwrap().starts_with("mxc://"));

    assert!(!puppet.update_info(bridge.context(), &contact, None).await.unwrap());
    assert_eq!(uploads(local.calls()), 1);
    assert_eq!(http.requests().len(), 1);

    contact.headimg = "http://img.local/carol2.jpg".to_string();
    assert!(puppet.update_info(bridge.context(), &contact, None).await.unwrap());
    assert_eq!(uploads(local.calls()), 2);
}

#[tokio::test]
async fn test_failed_local_send_records_nothing() {
    let t = TestBridge::new();
    t.local.set_fail_send(true);

    let msg = RemoteMessage::text("m1", "room1@chatroom", "userA", "acct1", 1000, "hi");
    assert!(t.bridge.handle_remote_message(&msg).await.is_err());
    assert!(t.local.messages().is_empty());
    assert_eq!(t.store.message_count().await, 0);
    // The room itself was created and is reused.
    assert_eq!(t.local.rooms_created().len(), 1);

    t.local.set_fail_send(false);
    let next = RemoteMessage::text("m2", "room1@chatroom", "userA", "acct1", 1001, "again");
    t.bridge.handle_remote_message(&next).await.unwrap();
    assert_eq!(t.local.rooms_created().len(), 1);
    assert_eq!(t.store.message_count().await, 1);
}
