// Copyright 2024 The xmpp-trust-store authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Types shared between the trust store, the group chat store and the
//! reconciler.

use std::collections::HashMap;

use bitflags::bitflags;

/// An opaque key identifier, as carried in trust message stanzas.
pub type KeyId = Vec<u8>;

/// Multimap of key owner JIDs to key IDs.
pub type OwnerKeyIds = HashMap<String, Vec<KeyId>>;

/// The changed (owner, key) pairs of a trust level mutation, per encryption
/// scheme.
pub type TrustChanges = HashMap<String, OwnerKeyIds>;

/// The graded confidence classification of an encryption key.
///
/// The discriminants are powers of two so that a set of levels can be
/// expressed as a [`TrustLevels`] bitmask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrustLevel {
    /// No decision has been made yet. This level is virtual: a key absent
    /// from the store has it, a stored key never does.
    Undecided = 1,
    /// The key was distrusted without user interaction.
    AutomaticallyDistrusted = 2,
    /// The key was distrusted by the user.
    ManuallyDistrusted = 4,
    /// The key was trusted without user interaction.
    AutomaticallyTrusted = 8,
    /// The key was trusted by the user.
    ManuallyTrusted = 16,
    /// The key was verified end-to-end (e.g. via a trust message from an
    /// already authenticated key).
    Authenticated = 32,
}

impl TrustLevel {
    pub(crate) fn from_sql(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Undecided),
            2 => Some(Self::AutomaticallyDistrusted),
            4 => Some(Self::ManuallyDistrusted),
            8 => Some(Self::AutomaticallyTrusted),
            16 => Some(Self::ManuallyTrusted),
            32 => Some(Self::Authenticated),
            _ => None,
        }
    }
}

impl From<TrustLevel> for TrustLevels {
    fn from(level: TrustLevel) -> Self {
        Self::from_bits_truncate(level as u8)
    }
}

bitflags! {
    /// A set of [`TrustLevel`]s, used to filter key queries.
    ///
    /// An empty set means "no filtering", i.e. all levels match.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TrustLevels: u8 {
        const UNDECIDED = 1;
        const AUTOMATICALLY_DISTRUSTED = 2;
        const MANUALLY_DISTRUSTED = 4;
        const AUTOMATICALLY_TRUSTED = 8;
        const MANUALLY_TRUSTED = 16;
        const AUTHENTICATED = 32;
    }
}

impl TrustLevels {
    /// The levels of this set that can actually be stored, as SQL integers.
    pub(crate) fn stored_levels(self) -> Vec<i64> {
        self.iter()
            .filter(|flag| *flag != Self::UNDECIDED)
            .map(|flag| i64::from(flag.bits()))
            .collect()
    }
}

/// The per-encryption-scheme rule governing whether newly seen keys are
/// trusted automatically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecurityPolicy {
    /// New keys are trusted automatically.
    #[default]
    NoSecurityPolicy = 0,
    /// Trust On first use And Key Authentication For All: new keys are
    /// trusted automatically only until the first key of their owner is
    /// authenticated.
    Toakafa = 1,
}

impl SecurityPolicy {
    pub(crate) fn from_sql(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::NoSecurityPolicy),
            1 => Some(Self::Toakafa),
            _ => None,
        }
    }
}

/// The postponed trust and distrust assertions of one or more sender keys.
///
/// The same (owner, key) pair may occur once per matching sender when the
/// result spans multiple sender keys; callers must tolerate the duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostponedTrustDecisions {
    /// Keys to trust once the sender key is authenticated.
    pub to_trust: OwnerKeyIds,
    /// Keys to distrust once the sender key is authenticated.
    pub to_distrust: OwnerKeyIds,
}

impl PostponedTrustDecisions {
    pub fn is_empty(&self) -> bool {
        self.to_trust.is_empty() && self.to_distrust.is_empty()
    }
}

/// The key owner element of a trust message: the keys of one owner that the
/// sender asserts to be trusted or distrusted.
#[derive(Clone, Debug, Default)]
pub struct TrustMessageKeyOwner {
    pub jid: String,
    pub trusted_keys: Vec<KeyId>,
    pub distrusted_keys: Vec<KeyId>,
}

/// The lifecycle status of a group chat user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupChatUserStatus {
    /// On the allow list but not joined.
    #[default]
    Allowed = 0,
    /// Currently a participant.
    Joined = 1,
    /// No longer a participant, kept for message history.
    Left = 2,
    /// Banned from the chat.
    Banned = 3,
}

impl GroupChatUserStatus {
    pub(crate) fn from_sql(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Allowed),
            1 => Some(Self::Joined),
            2 => Some(Self::Left),
            3 => Some(Self::Banned),
            _ => None,
        }
    }
}

/// A user's relationship to a group chat.
///
/// A user is addressable by a participant ID (`id`), a bare JID (`jid`) or
/// both. Participants of anonymous group chats only have an ID, users that
/// are allowed to join but have not joined yet only have a JID. At least one
/// of the two must be non-empty; both use the empty string for "absent".
#[derive(Clone, Debug, Default)]
pub struct GroupChatUser {
    pub account_jid: String,
    pub chat_jid: String,
    pub id: String,
    pub jid: String,
    pub name: String,
    pub status: GroupChatUserStatus,
}

impl PartialEq for GroupChatUser {
    /// Two records are equal when they belong to the same account and chat,
    /// carry the same name and status, and match on a non-empty identity
    /// channel (id or jid).
    fn eq(&self, other: &Self) -> bool {
        let id_match = !self.id.is_empty() && self.id == other.id;
        let jid_match = !self.jid.is_empty() && self.jid == other.jid;

        self.account_jid == other.account_jid
            && self.chat_jid == other.chat_jid
            && (id_match || jid_match)
            && self.name == other.name
            && self.status == other.status
    }
}

/// A change to the set of stored group chat users, broadcast by the store.
#[derive(Clone, Debug)]
pub enum GroupChatUserEvent {
    Added(GroupChatUser),
    Updated(GroupChatUser),
    Removed(GroupChatUser),
    /// The set of JIDs of a chat changed, i.e. a user was added or removed.
    /// Consumed to re-key encryption recipient lists.
    JidsChanged { account_jid: String, chat_jid: String },
}

/// A change to the stored trust levels, broadcast by the trust store.
#[derive(Clone, Debug)]
pub enum TrustEvent {
    /// The effective trust level of the contained (owner, key) pairs
    /// transitioned.
    KeysChanged { changes: TrustChanges },
}
