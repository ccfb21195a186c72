use std::time::Duration;

use wechat_bridge::bridge::SENDER_LOOKUP_TIMEOUT;
use wechat_bridge::config::ManualLogin;
use wechat_bridge::formatter::MessageType;
use wechat_bridge::portal::Delivery;
use wechat_bridge::store::{MessageStore, PortalStore};
use wechat_bridge::test_utils::{TestBridge, test_config};
use wechat_bridge::wxcore::{MessageKind, QuotedMessage, RemoteMessage, WechatId};

fn m1() -> RemoteMessage {
    RemoteMessage::text("m1", "room1@chatroom", "userA", "acct1", 1000, "hi")
}

#[tokio::test]
async fn test_first_message_creates_room_and_records_it() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();

    let delivery = t.bridge.handle_remote_message(&m1()).await.unwrap();
    let Delivery::Delivered { event_id } = delivery.clone() else {
        panic!("expected a delivery, got {delivery:?}");
    };

    let rooms = t.local.rooms_created();
    assert_eq!(rooms.len(), 1);
    let (room_id, request) = &rooms[0];
    assert_eq!(request.creator, "@wechatbot:hs.local");
    assert!(request.invite.contains(&"@boss:hs.local".to_string()));
    assert!(!request.is_direct);
    assert!(
        request
            .initial_state
            .iter()
            .any(|event| event.event_type == "m.bridge")
    );

    let messages = t.local.messages();
    assert_eq!(messages.len(), 1);
    let (as_user, msg_room, content) = &messages[0];
    assert_eq!(as_user, "@wechat_user_a:hs.local");
    assert_eq!(msg_room, room_id);
    assert_eq!(content.msgtype, MessageType::Text);
    assert_eq!(content.body, "hi");

    let record = t
        .store
        .get_message_by_remote(
            &"userA".into(),
            &"room1@chatroom".into(),
            &"acct1".into(),
            1000,
        )
        .await
        .unwrap()
        .expect("message record should be stored");
    assert_eq!(record.mxid, event_id);
    assert_eq!(&record.mx_room, room_id);
    assert_eq!(record.id, "m1");

    let portal = t
        .store
        .get_portal(&"room1@chatroom".into(), &"acct1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(portal.mxid.as_ref(), Some(room_id));
}

#[tokio::test]
async fn test_repeated_message_has_no_side_effects() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();

    t.bridge.handle_remote_message(&m1()).await.unwrap();
    let calls_before = t.local.calls().len();

    let again = t.bridge.handle_remote_message(&m1()).await.unwrap();
    assert_eq!(again, Delivery::DuplicateRecent);
    assert_eq!(t.local.rooms_created().len(), 1);
    assert_eq!(t.local.messages().len(), 1);
    assert_eq!(t.local.calls().len(), calls_before);
    assert_eq!(t.store.message_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_copies_of_one_message_deliver_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bridge = t.bridge.clone();
        handles.push(tokio::spawn(async move {
            bridge.handle_remote_message(&m1()).await.unwrap()
        }));
    }
    let mut delivered = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Delivery::Delivered { .. } => delivered += 1,
            Delivery::DuplicateRecent | Delivery::DuplicateStored => {}
        }
    }

    assert_eq!(delivered, 1);
    assert_eq!(t.local.messages().len(), 1);
    assert_eq!(t.local.rooms_created().len(), 1);
    assert_eq!(t.store.message_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_box_only_delays_delivery_briefly() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new().logged_in("acct1").await;
    t.factory.set_responder(|_| Vec::new());

    let started = tokio::time::Instant::now();
    let delivery = t.bridge.handle_remote_message(&m1()).await.unwrap();
    assert!(matches!(delivery, Delivery::Delivered { .. }));
    // One contact lookup and one chatroom nick lookup, both given up on.
    assert!(started.elapsed() <= SENDER_LOOKUP_TIMEOUT * 2 + Duration::from_secs(1));
    assert_eq!(t.local.messages().len(), 1);
}

#[tokio::test]
async fn test_stored_record_catches_evicted_duplicates() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();
    let msg = m1();

    t.bridge.handle_remote_message(&msg).await.unwrap();

    let portal = t
        .bridge
        .identities()
        .get_portal(&msg.source, &msg.receiver, false)
        .await
        .unwrap()
        .unwrap();
    for i in 0..150 {
        portal
            .push_recent(&format!("dummy{i}"), &msg.source, &msg.sender, 2000 + i)
            .await;
    }

    let again = t.bridge.handle_remote_message(&msg).await.unwrap();
    assert_eq!(again, Delivery::DuplicateStored);
    assert_eq!(t.local.messages().len(), 1);
    assert_eq!(t.store.message_count().await, 1);
}

#[tokio::test]
async fn test_room_creation_failure_drops_message_and_retries_later() {
    let _ = env_logger::builder().is_test(true).try_init();
    let t = TestBridge::new();

    t.local.set_fail_create_room(true);
    assert!(t.bridge.handle_remote_message(&m1()).await.is_err());
    assert!(t.local.messages().is_empty());
    assert_eq!(t.store.message_count().await, 0);

    t.local.set_fail_create_room(false);
    let next = RemoteMessage::text("m2", "room1@chatroom", "userA", "acct1", 1001, "there");
    let delivery = t.bridge.handle_remote_message(&next).await.unwrap();
    assert!(matches!(delivery, Delivery::Delivered { .. }));
    assert_eq!(t.local.rooms_created().len(), 1);
}

#[tokio::test]
async fn test_direct_chat_room_belongs_to_the_puppet() {
    let t = TestBridge::new();
    let msg = RemoteMessage::text("d1", "wxid_bob", "wxid_bob", "acct1", 50, "yo");

    t.bridge.handle_remote_message(&msg).await.unwrap();

    let rooms = t.local.rooms_created();
    assert_eq!(rooms.len(), 1);
    let request = &rooms[0].1;
    assert!(request.is_direct);
    assert_eq!(request.creator, "@wechat_wxid__bob:hs.local");
    assert!(request.invite.contains(&"@wechatbot:hs.local".to_string()));
    assert_eq!(request.name, None);
    let (as_user, _, _) = &t.local.messages()[0];
    assert_eq!(as_user, "@wechat_wxid__bob:hs.local");
}

#[tokio::test]
async fn test_same_chat_for_two_receivers_gets_two_rooms() {
    let t = TestBridge::new();
    let a = RemoteMessage::text("m1", "room1@chatroom", "userA", "acct1", 1000, "hi");
    let b = RemoteMessage::text("m1", "room1@chatroom", "userA", "acct2", 1000, "hi");

    t.bridge.handle_remote_message(&a).await.unwrap();
    t.bridge.handle_remote_message(&b).await.unwrap();

    assert_eq!(t.local.rooms_created().len(), 2);
    assert_eq!(t.store.portal_count().await, 2);
    assert_eq!(t.store.message_count().await, 2);
}

#[tokio::test]
async fn test_quote_of_bridged_message_becomes_reply() {
    let t = TestBridge::new();
    let original = RemoteMessage::text("m1", "room1@chatroom", "userA", "acct1", 1000, "lunch?");
    let Delivery::Delivered { event_id } = t.bridge.handle_remote_message(&original).await.unwrap()
    else {
        panic!("first message should be delivered");
    };

    let mut reply = RemoteMessage::text("m2", "room1@chatroom", "userB", "acct1", 1010, "");
    reply.kind = MessageKind::Quote {
        text: "sure".to_string(),
        quoted: Some(QuotedMessage {
            sender: WechatId::from("userA"),
            source: WechatId::from("room1@chatroom"),
            display_name: "A".to_string(),
            content: "lunch?".to_string(),
        }),
    };
    t.bridge.handle_remote_message(&reply).await.unwrap();

    let messages = t.local.messages();
    let (_, _, content) = messages.last().unwrap();
    assert_eq!(content.body, "sure");
    assert_eq!(content.reply_to(), Some(event_id.as_str()));

    let mut unknown = RemoteMessage::text("m3", "room1@chatroom", "userB", "acct1", 1020, "");
    unknown.kind = MessageKind::Quote {
        text: "what?".to_string(),
        quoted: Some(QuotedMessage {
            sender: WechatId::from("userC"),
            source: WechatId::from("room1@chatroom"),
            display_name: "C".to_string(),
            content: "old news".to_string(),
        }),
    };
    t.bridge.handle_remote_message(&unknown).await.unwrap();
    let messages = t.local.messages();
    let (_, _, content) = messages.last().unwrap();
    assert_eq!(content.body, "> C: old news\n\nwhat?");
    assert_eq!(content.reply_to(), None);
}

#[tokio::test]
async fn test_pictures_are_decoded_and_uploaded() {
    let dir = tempfile::tempdir().unwrap();
    let jpeg = [0xffu8, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46, 0x49, 0x46];
    let obfuscated: Vec<u8> = jpeg.iter().map(|b| b ^ 0x33).collect();
    std::fs::create_dir_all(dir.path().join("Image")).unwrap();
    std::fs::write(dir.path().join("Image").join("abc.dat"), obfuscated).unwrap();

    let mut config = test_config();
    config.bridge.files_dir = Some(dir.path().to_path_buf());
    let t = TestBridge::with_config(config);

    let mut msg = RemoteMessage::text("p1", "wxid_bob", "wxid_bob", "acct1", 77, "");
    msg.kind = MessageKind::Picture {
        detail: Some("Image\\abc.dat".to_string()),
        thumb: None,
        xml: String::new(),
    };
    t.bridge.handle_remote_message(&msg).await.unwrap();

    let (_, _, content) = t.local.messages().pop().unwrap();
    assert_eq!(content.msgtype, MessageType::Image);
    assert_eq!(content.body, "abc.jpg");
    assert!(content.url.is_some());
    let info = content.info.unwrap();
    assert_eq!(info.mimetype.as_deref(), Some("image/jpeg"));
    assert_eq!(info.size, Some(jpeg.len()));

    let mut missing = msg.clone();
    missing.id = "p2".to_string();
    missing.timestamp = 78;
    missing.kind = MessageKind::Picture {
        detail: Some("Image\\gone.dat".to_string()),
        thumb: None,
        xml: String::new(),
    };
    t.bridge.handle_remote_message(&missing).await.unwrap();
    let (_, _, content) = t.local.messages().pop().unwrap();
    assert_eq!(content.msgtype, MessageType::Notice);
    assert!(content.body.starts_with("Failed to bridge picture"));
}

#[tokio::test]
async fn test_missing_picture_falls_back_to_thumbnail() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let jpeg = [0xffu8, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46, 0x49, 0x46];
    let obfuscated: Vec<u8> = jpeg.iter().map(|b| b ^ 0x5a).collect();
    std::fs::create_dir_all(dir.path().join("Thumb")).unwrap();
    std::fs::write(dir.path().join("Thumb").join("t.dat"), obfuscated).unwrap();

    let mut config = test_config();
    config.bridge.files_dir = Some(dir.path().to_path_buf());
    let t = TestBridge::with_config(config);

    let mut msg = RemoteMessage::text("p1", "wxid_bob", "wxid_bob", "acct1", 77, "");
    msg.kind = MessageKind::Picture {
        detail: Some("Image\\gone.dat".to_string()),
        thumb: Some("Thumb\\t.dat".to_string()),
        xml: String::new(),
    };
    t.bridge.handle_remote_message(&msg).await.unwrap();

    let (_, _, content) = t.local.messages().pop().unwrap();
    assert_eq!(content.msgtype, MessageType::Image);
    assert_eq!(content.body, "t.jpg");
    assert!(content.url.is_some());

    // A thumbnail that is missing too still ends in a notice.
    let mut lost = msg.clone();
    lost.id = "p2".to_string();
    lost.timestamp = 78;
    lost.kind = MessageKind::Picture {
        detail: Some("Image\\gone.dat".to_string()),
        thumb: Some("Thumb\\gone.dat".to_string()),
        xml: String::new(),
    };
    t.bridge.handle_remote_message(&lost).await.unwrap();
    let (_, _, content) = t.local.messages().pop().unwrap();
    assert_eq!(content.msgtype, MessageType::Notice);
}

async fn wait_for_messages(t: &TestBridge, count: usize) {
    for _ in 0..200 {
        if t.local.messages().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pushed_frames_are_delivered_in_order_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = test_config();
    config.wechat.manual_login = Some(ManualLogin {
        wxid: "acct1".to_string(),
        wxcode: String::new(),
        wxname: "Owner".to_string(),
    });
    let mut t = TestBridge::with_config(config);
    let events = t.events.take().unwrap();
    t.bridge.start(events).await.unwrap();

    // Give the bootstrap a moment to log the account in.
    for _ in 0..200 {
        if t.client.own_wxid().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let frame = |id: &str, time: &str, text: &str| {
        format!(
            r#"{{"id":"{id}","type":1,"wxid":"room1@chatroom","id1":"userA","content":"{text}","time":"{time}"}}"#
        )
    };
    assert!(t.factory.push_frame(frame("f1", "2024-03-01 10:00:00", "one")).await);
    assert!(t.factory.push_frame(frame("f2", "2024-03-01 10:00:01", "two")).await);
    assert!(t.factory.push_frame(frame("f1", "2024-03-01 10:00:00", "one")).await);
    assert!(t.factory.push_frame(frame("f3", "2024-03-01 10:00:02", "three")).await);

    wait_for_messages(&t, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bodies: Vec<String> = t
        .local
        .messages()
        .into_iter()
        .map(|(_, _, content)| content.body)
        .collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
    assert_eq!(t.local.rooms_created().len(), 1);

    let user = t.bridge.users().get_by_wxid(&"acct1".into()).await.unwrap();
    assert_eq!(user.map(|u| u.mxid().to_string()).as_deref(), Some("@boss:hs.local"));

    t.bridge.stop().await;
    assert!(!t.client.is_connected());
}
