//! Keys of everything this service keeps in the shared key-value namespace.
//!
//! | Key | Layout |
//! |-----|--------|
//! | [`UserKey`] | `users:<external_id>` |
//! | [`UserIdKey`] | `user_ids:<id>` |
//! | [`StateKey`] | `fsm:<bot_id>:<chat_id>:<thread_id>:<user_id>:<destiny>:<part>` |
//!
//! Prefixes differ, so no two key types can produce the same string. Within a
//! type every key has the same number of parts.

use courier_core::key::KeyPart;
use courier_core::{key_parts, ExternalId, KeySchema, StorageKey, UserId};

/// Cached user DTO, addressed by the platform id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserKey {
    pub external_id: ExternalId,
}

impl StorageKey for UserKey {
    const SCHEMA: KeySchema = KeySchema::prefixed("users");

    fn parts(&self) -> Vec<(&'static str, String)> {
        key_parts![("external_id", self.external_id)]
    }
}

/// Alias from the store-assigned id to the external id of a cached user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdKey {
    pub id: UserId,
}

impl StorageKey for UserIdKey {
    const SCHEMA: KeySchema = KeySchema::prefixed("user_ids");

    fn parts(&self) -> Vec<(&'static str, String)> {
        key_parts![("id", self.id)]
    }
}

/// Slot of a conversation-state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePart {
    State,
    Data,
    Lock,
}

impl KeyPart for StatePart {
    fn encode_key(&self) -> String {
        match self {
            StatePart::State => "state",
            StatePart::Data => "data",
            StatePart::Lock => "lock",
        }
        .to_string()
    }
}

pub const DEFAULT_DESTINY: &str = "default";

/// Placeholder for an absent bot or thread id.
pub const ABSENT: &str = "null";

/// Conversation-state key shared with the bot's dialogue storage.
///
/// Absent optional coordinates are written as [`ABSENT`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateKey {
    pub bot_id: Option<i64>,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub user_id: i64,
    pub destiny: String,
    pub part: StatePart,
}

impl StateKey {
    pub fn new(chat_id: i64, user_id: i64, part: StatePart) -> Self {
        Self {
            bot_id: None,
            chat_id,
            thread_id: None,
            user_id,
            destiny: DEFAULT_DESTINY.to_string(),
            part,
        }
    }

    pub fn with_bot(mut self, bot_id: i64) -> Self {
        self.bot_id = Some(bot_id);
        self
    }

    pub fn with_thread(mut self, thread_id: i64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn with_destiny(mut self, destiny: impl Into<String>) -> Self {
        self.destiny = destiny.into();
        self
    }
}

impl StorageKey for StateKey {
    const SCHEMA: KeySchema = KeySchema::prefixed("fsm");

    fn parts(&self) -> Vec<(&'static str, String)> {
        let optional = |id: Option<i64>| id.map_or_else(|| ABSENT.to_string(), |id| id.encode_key());
        let mut parts = vec![
            ("bot_id", optional(self.bot_id)),
            ("chat_id", self.chat_id.encode_key()),
            ("thread_id", optional(self.thread_id)),
        ];
        parts.extend(key_parts![
            ("user_id", self.user_id),
            ("destiny", self.destiny),
            ("part", self.part),
        ]);
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::KeyError;
    use proptest::prelude::*;

    #[test]
    fn user_key_layout() {
        let key = UserKey {
            external_id: ExternalId::new(111),
        };
        assert_eq!(key.pack().unwrap(), "users:111");
        let alias = UserIdKey { id: UserId::new(1) };
        assert_eq!(alias.pack().unwrap(), "user_ids:1");
    }

    #[test]
    fn state_key_layout() {
        let key = StateKey::new(-100, 7, StatePart::Data);
        assert_eq!(key.pack().unwrap(), "fsm:null:-100:null:7:default:data");

        let key = StateKey::new(5, 7, StatePart::State)
            .with_bot(42)
            .with_thread(3)
            .with_destiny("survey");
        assert_eq!(key.pack().unwrap(), "fsm:42:5:3:7:survey:state");
    }

    #[test]
    fn bot_and_thread_ids_keep_their_positions() {
        let with_bot = StateKey::new(5, 7, StatePart::State).with_bot(42);
        let with_thread = StateKey::new(42, 7, StatePart::State).with_thread(5);

        assert_eq!(with_bot.pack().unwrap(), "fsm:42:5:null:7:default:state");
        assert_eq!(with_thread.pack().unwrap(), "fsm:null:42:5:7:default:state");
        assert_ne!(with_bot.pack().unwrap(), with_thread.pack().unwrap());
    }

    #[test]
    fn destiny_must_not_contain_the_separator() {
        let key = StateKey::new(1, 2, StatePart::Lock).with_destiny("a:b");
        assert!(matches!(
            key.pack(),
            Err(KeyError::SeparatorInValue { field: "destiny", .. })
        ));
    }

    proptest! {
        #[test]
        fn user_and_state_keys_never_collide(
            external_id in any::<i64>(),
            chat_id in any::<i64>(),
            user_id in any::<i64>(),
        ) {
            let user = UserKey { external_id: ExternalId::new(external_id) }.pack().unwrap();
            let state = StateKey::new(chat_id, user_id, StatePart::State).pack().unwrap();
            let alias = UserIdKey { id: UserId::new(external_id) }.pack().unwrap();
            prop_assert_ne!(&user, &state);
            prop_assert_ne!(&user, &alias);
        }

        #[test]
        fn distinct_state_keys_pack_differently(
            a in (proptest::option::of(-3i64..3), -3i64..3, proptest::option::of(-3i64..3), -3i64..3),
            b in (proptest::option::of(-3i64..3), -3i64..3, proptest::option::of(-3i64..3), -3i64..3),
        ) {
            let key = |(bot, chat, thread, user): (Option<i64>, i64, Option<i64>, i64)| StateKey {
                bot_id: bot,
                thread_id: thread,
                ..StateKey::new(chat, user, StatePart::Data)
            };
            let (left, right) = (key(a), key(b));
            prop_assert_eq!(left == right, left.pack().unwrap() == right.pack().unwrap());
        }
    }
}
