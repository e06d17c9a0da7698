//! Ordered message log with an id index.

use std::collections::HashMap;

use crate::{Message, MessageId};

/// What [`MessageStore::add`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended at the end of the log.
    Inserted,
    /// A message with the same id existed and was replaced in place.
    Replaced,
}

/// Message store shared by the reducer and the reconciler.
///
/// Messages keep their insertion position for their whole life. Ids are
/// unique: adding a message whose id is already present replaces the earlier
/// copy where it stands. Nothing is removed except by [`clear`](Self::clear)
/// and [`replace_all`](Self::replace_all).
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: Vec<Message>,
    index: HashMap<MessageId, usize>,
    revision: u64,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(32),
            index: HashMap::new(),
            revision: 0,
        }
    }

    /// Add a message, deduplicating by id.
    pub fn add(&mut self, msg: Message) -> AddOutcome {
        self.revision += 1;
        if let Some(&pos) = self.index.get(&msg.id) {
            self.entries[pos] = msg;
            AddOutcome::Replaced
        } else {
            self.index.insert(msg.id.clone(), self.entries.len());
            self.entries.push(msg);
            AddOutcome::Inserted
        }
    }

    /// Get a message by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    /// Whether a message with this id exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Mutate a message in place.
    ///
    /// Returns `false` if no message has this id. The closure must not change
    /// `id`; use [`rekey`](Self::rekey) for that.
    pub fn update<F>(&mut self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };
        let entry = &mut self.entries[pos];
        f(entry);
        debug_assert_eq!(entry.id, id, "update must not change the message id");
        self.revision += 1;
        true
    }

    /// Change a message's id, keeping its position.
    ///
    /// Returns `false` if `old` is missing or `new` is already taken by
    /// another message.
    pub fn rekey(&mut self, old: &str, new: &str) -> bool {
        if old == new {
            return self.contains(old);
        }
        if self.index.contains_key(new) {
            return false;
        }
        let Some(pos) = self.index.remove(old) else {
            return false;
        };
        self.entries[pos].id = new.to_string();
        self.index.insert(new.to_string(), pos);
        self.revision += 1;
        true
    }

    /// Remove every message.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.revision += 1;
    }

    /// Replace the whole log, deduplicating by id.
    pub fn replace_all<I>(&mut self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        self.clear();
        for msg in messages {
            self.add(msg);
        }
    }

    /// All messages in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    /// Get a snapshot of the log.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.entries.clone()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counter bumped by every mutation.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }
}
