use super::*;
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn confirmed(id: i64, sender: i64, content: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        local_id: None,
        server_id: Some(MessageId(id)),
        sender_id: UserId(sender),
        sender_name: format!("user{sender}"),
        content: content.to_string(),
        created_at: at(secs),
        reactions: Vec::new(),
    }
}

fn optimistic(local_id: Uuid, sender: i64, content: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        local_id: Some(local_id),
        server_id: None,
        sender_id: UserId(sender),
        sender_name: format!("user{sender}"),
        content: content.to_string(),
        created_at: at(secs),
        reactions: Vec::new(),
    }
}

fn contents(store: &MessageStore, channel: ChannelKey) -> Vec<String> {
    store
        .messages(channel)
        .iter()
        .map(|m| m.content.clone())
        .collect()
}

#[test]
fn append_is_idempotent_over_server_identity() {
    let mut store = MessageStore::default();
    assert!(store.append(ChannelKey::Public, confirmed(1, 2, "hello", 10)));
    assert!(!store.append(ChannelKey::Public, confirmed(1, 2, "hello", 10)));
    assert_eq!(store.messages(ChannelKey::Public).len(), 1);
}

#[test]
fn append_orders_by_creation_time() {
    let mut store = MessageStore::default();
    store.append(ChannelKey::Public, confirmed(3, 1, "third", 30));
    store.append(ChannelKey::Public, confirmed(1, 1, "first", 10));
    store.append(ChannelKey::Public, confirmed(2, 1, "second", 20));
    assert_eq!(
        contents(&store, ChannelKey::Public),
        vec!["first", "second", "third"]
    );
}

#[test]
fn reconcile_upgrades_identity_in_place() {
    let mut store = MessageStore::default();
    let local_id = Uuid::new_v4();
    store.append(ChannelKey::Public, confirmed(1, 2, "before", 10));
    store.append(ChannelKey::Public, optimistic(local_id, 1, "mine", 20));
    store.append(ChannelKey::Public, confirmed(2, 2, "after", 30));

    assert!(store.reconcile(ChannelKey::Public, local_id, MessageId(9)));

    let messages = store.messages(ChannelKey::Public);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content, "mine");
    assert_eq!(messages[1].server_id, Some(MessageId(9)));
    assert!(messages[1].local_id.is_none());
}

#[test]
fn reconcile_removes_optimistic_entry_when_identity_already_present() {
    let mut store = MessageStore::default();
    let local_id = Uuid::new_v4();
    store.append(ChannelKey::Public, optimistic(local_id, 1, "mine", 20));
    // History delivered the confirmed record before the live echo.
    store.append(ChannelKey::Public, confirmed(9, 1, "mine", 20));

    assert!(store.reconcile(ChannelKey::Public, local_id, MessageId(9)));

    let messages = store.messages(ChannelKey::Public);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].server_id, Some(MessageId(9)));
}

#[test]
fn reconcile_of_unknown_local_id_is_a_noop() {
    let mut store = MessageStore::default();
    store.append(ChannelKey::Public, confirmed(1, 2, "hello", 10));
    assert!(!store.reconcile(ChannelKey::Public, Uuid::new_v4(), MessageId(2)));
    assert_eq!(store.messages(ChannelKey::Public).len(), 1);
}

#[test]
fn reactions_attach_to_the_owning_channel() {
    let mut store = MessageStore::default();
    store.append(ChannelKey::Private(UserId(4)), confirmed(7, 4, "psst", 10));

    let channel = store.attach_reaction(
        MessageId(7),
        Reaction {
            username: "bob".into(),
            symbol: "+1".into(),
        },
    );
    assert_eq!(channel, Some(ChannelKey::Private(UserId(4))));
    assert_eq!(
        store.messages(ChannelKey::Private(UserId(4)))[0].reactions.len(),
        1
    );
}

#[test]
fn reaction_for_unknown_message_is_dropped() {
    let mut store = MessageStore::default();
    store.append(ChannelKey::Public, confirmed(1, 2, "hello", 10));
    let channel = store.attach_reaction(
        MessageId(99),
        Reaction {
            username: "bob".into(),
            symbol: "+1".into(),
        },
    );
    assert!(channel.is_none());
    assert!(store.messages(ChannelKey::Public)[0].reactions.is_empty());
}

#[test]
fn clear_wipes_one_channel_only() {
    let mut store = MessageStore::default();
    store.append(ChannelKey::Public, confirmed(1, 2, "hello", 10));
    store.append(ChannelKey::Private(UserId(4)), confirmed(2, 4, "psst", 20));

    store.clear(ChannelKey::Public);

    assert!(store.messages(ChannelKey::Public).is_empty());
    assert_eq!(store.messages(ChannelKey::Private(UserId(4))).len(), 1);
}
