use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{MessageId, UserId};
use shared::protocol::MessageRecord;
use uuid::Uuid;

/// Routing key for a conversation: the shared public room, or a private
/// conversation keyed by the remote party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Public,
    Private(UserId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub username: String,
    pub symbol: String,
}

/// One chat message with a two-phase identity: `local_id` until the backend
/// confirms the send, `server_id` afterwards. Reconciliation is the only
/// transition between the two.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub local_id: Option<Uuid>,
    pub server_id: Option<MessageId>,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reactions: Vec<Reaction>,
}

impl ChatMessage {
    pub fn from_record(record: &MessageRecord) -> Self {
        Self {
            local_id: None,
            server_id: Some(record.id),
            sender_id: record.sender_id,
            sender_name: record.username.clone(),
            content: record.content.clone(),
            created_at: record.created_at,
            reactions: record
                .reactions
                .iter()
                .map(|r| Reaction {
                    username: r.username.clone(),
                    symbol: r.reaction.clone(),
                })
                .collect(),
        }
    }
}

/// Per-channel message lists, ordered by creation time. Appends are
/// idempotent over the server identity, so history fetches and live frames
/// can overlap in any order without duplicating a message.
#[derive(Debug, Default)]
pub struct MessageStore {
    channels: HashMap<ChannelKey, Vec<ChatMessage>>,
}

impl MessageStore {
    /// Inserts a message at its timestamp position. Returns false without
    /// modifying anything when the channel already holds the same server
    /// identity.
    pub fn append(&mut self, channel: ChannelKey, message: ChatMessage) -> bool {
        let entries = self.channels.entry(channel).or_default();
        if let Some(server_id) = message.server_id {
            if entries.iter().any(|m| m.server_id == Some(server_id)) {
                return false;
            }
        }
        let at = entries.partition_point(|m| m.created_at <= message.created_at);
        entries.insert(at, message);
        true
    }

    /// Upgrades an optimistic entry to its confirmed identity in place,
    /// preserving its position. If the confirmed identity already arrived
    /// through another path the optimistic entry is removed instead, so the
    /// channel never holds the same server identity twice.
    pub fn reconcile(&mut self, channel: ChannelKey, local_id: Uuid, server_id: MessageId) -> bool {
        let Some(entries) = self.channels.get_mut(&channel) else {
            return false;
        };
        let Some(at) = entries.iter().position(|m| m.local_id == Some(local_id)) else {
            return false;
        };
        if entries.iter().any(|m| m.server_id == Some(server_id)) {
            entries.remove(at);
            return true;
        }
        let entry = &mut entries[at];
        entry.server_id = Some(server_id);
        entry.local_id = None;
        true
    }

    pub fn contains_local(&self, channel: ChannelKey, local_id: Uuid) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|entries| entries.iter().any(|m| m.local_id == Some(local_id)))
    }

    /// Attaches a reaction to the confirmed message that owns `server_id`,
    /// wherever it lives. Returns the touched channel, or None when the
    /// message is unknown and the reaction is dropped.
    pub fn attach_reaction(
        &mut self,
        server_id: MessageId,
        reaction: Reaction,
    ) -> Option<ChannelKey> {
        for (channel, entries) in &mut self.channels {
            if let Some(entry) = entries.iter_mut().find(|m| m.server_id == Some(server_id)) {
                entry.reactions.push(reaction);
                return Some(*channel);
            }
        }
        None
    }

    /// Wipes a single channel. Other channels are untouched.
    pub fn clear(&mut self, channel: ChannelKey) {
        self.channels.remove(&channel);
    }

    pub fn messages(&self, channel: ChannelKey) -> &[ChatMessage] {
        self.channels
            .get(&channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
