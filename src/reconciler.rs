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

//! Routing of protocol events to the trust and group chat stores.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{
    error::Result,
    group_chat_store::SqliteGroupChatStore,
    trust_store::SqliteTrustStore,
    types::{
        GroupChatUser, GroupChatUserStatus, KeyId, SecurityPolicy, TrustChanges, TrustLevel,
        TrustLevels, TrustMessageKeyOwner,
    },
};

/// Applies incoming protocol events to the persisted trust and membership
/// state.
///
/// Events arrive from the connection layer (affiliation changes, presence,
/// messages, trust message stanzas); the reconciler decides which store
/// mutation each of them maps to. Trust assertions whose sender key is not
/// yet trusted are diverted into the postponed ledger instead of being
/// applied, and replayed once the sender key resolves.
///
/// One reconciler is constructed per account session and handed its store
/// instances; it holds no state of its own.
#[derive(Clone, Debug)]
pub struct Reconciler {
    trust: Arc<SqliteTrustStore>,
    users: Arc<SqliteGroupChatStore>,
}

impl Reconciler {
    pub fn new(trust: Arc<SqliteTrustStore>, users: Arc<SqliteGroupChatStore>) -> Self {
        Self { trust, users }
    }

    /// Handle a user that was allowed to join a group chat.
    pub async fn handle_user_allowed(&self, mut user: GroupChatUser) -> Result<()> {
        user.status = GroupChatUserStatus::Allowed;
        self.users.handle_user_allowed_or_banned(user).await
    }

    /// Handle a user that was banned from a group chat.
    pub async fn handle_user_banned(&self, mut user: GroupChatUser) -> Result<()> {
        user.status = GroupChatUserStatus::Banned;
        self.users.handle_user_allowed_or_banned(user).await
    }

    /// Handle a user whose permission to join a group chat was revoked.
    pub async fn handle_user_disallowed(&self, mut user: GroupChatUser) -> Result<()> {
        user.status = GroupChatUserStatus::Allowed;
        self.users.handle_user_disallowed_or_unbanned(user).await
    }

    /// Handle a user that was unbanned from a group chat.
    pub async fn handle_user_unbanned(&self, mut user: GroupChatUser) -> Result<()> {
        user.status = GroupChatUserStatus::Banned;
        self.users.handle_user_disallowed_or_unbanned(user).await
    }

    /// Handle a participant that joined a group chat or changed its data.
    pub async fn handle_participant_joined(&self, participant: GroupChatUser) -> Result<()> {
        self.users.handle_participant_received(participant).await
    }

    /// Handle a participant that left a group chat.
    pub async fn handle_participant_left(&self, participant: GroupChatUser) -> Result<()> {
        self.users.handle_participant_left(participant).await
    }

    /// Handle the sender of a received group chat message.
    pub async fn handle_message_sender(&self, sender: GroupChatUser) -> Result<()> {
        self.users.handle_message_sender(sender).await
    }

    /// Handle newly seen keys of a key owner.
    ///
    /// The initial trust level follows the scheme's security policy: without
    /// a policy new keys are trusted automatically; under TOAKAFA they are
    /// trusted automatically only until the owner has an authenticated key,
    /// and distrusted automatically afterwards.
    #[instrument(skip(self, key_ids))]
    pub async fn handle_keys_received(
        &self,
        encryption: &str,
        key_owner_jid: &str,
        key_ids: Vec<KeyId>,
    ) -> Result<()> {
        let trust_level = match self.trust.security_policy(encryption).await? {
            SecurityPolicy::NoSecurityPolicy => TrustLevel::AutomaticallyTrusted,
            SecurityPolicy::Toakafa => {
                if self
                    .trust
                    .has_key(encryption, key_owner_jid, TrustLevels::AUTHENTICATED)
                    .await?
                {
                    TrustLevel::AutomaticallyDistrusted
                } else {
                    TrustLevel::AutomaticallyTrusted
                }
            }
        };

        self.trust.add_keys(encryption, key_owner_jid, key_ids, trust_level).await
    }

    /// Handle a received trust message.
    ///
    /// When the sender key is already authenticated or automatically trusted,
    /// its assertions are applied right away: asserted-trusted keys become
    /// `Authenticated`, asserted-distrusted keys become `ManuallyDistrusted`.
    /// Any other sender key level postpones the assertions until the sender
    /// key itself resolves.
    #[instrument(skip(self, sender_key_id, key_owners))]
    pub async fn handle_trust_message(
        &self,
        encryption: &str,
        sender_jid: &str,
        sender_key_id: &[u8],
        key_owners: Vec<TrustMessageKeyOwner>,
    ) -> Result<TrustChanges> {
        let sender_level = self.trust.trust_level(encryption, sender_jid, sender_key_id).await?;

        if !matches!(
            sender_level,
            TrustLevel::Authenticated | TrustLevel::AutomaticallyTrusted
        ) {
            debug!(?sender_level, "Postponing trust message of unresolved sender key");
            self.trust
                .add_keys_for_postponed_trust_decisions(encryption, sender_key_id, key_owners)
                .await?;
            return Ok(TrustChanges::default());
        }

        let mut to_trust = Vec::new();
        let mut to_distrust = Vec::new();
        for key_owner in key_owners {
            to_trust
                .extend(key_owner.trusted_keys.into_iter().map(|id| (key_owner.jid.clone(), id)));
            to_distrust.extend(
                key_owner.distrusted_keys.into_iter().map(|id| (key_owner.jid.clone(), id)),
            );
        }

        let mut changes = self
            .trust
            .set_trust_level(encryption, to_trust, TrustLevel::Authenticated)
            .await?;
        let distrust_changes = self
            .trust
            .set_trust_level(encryption, to_distrust, TrustLevel::ManuallyDistrusted)
            .await?;

        for (encryption, owner_key_ids) in distrust_changes {
            let merged = changes.entry(encryption).or_default();
            for (owner, key_ids) in owner_key_ids {
                merged.entry(owner).or_default().extend(key_ids);
            }
        }

        Ok(changes)
    }

    /// Handle sender keys that became authenticated: replay their postponed
    /// assertions and purge them from the ledger, as one atomic unit.
    pub async fn handle_sender_keys_authenticated(
        &self,
        encryption: &str,
        sender_key_ids: Vec<KeyId>,
    ) -> Result<TrustChanges> {
        self.trust.apply_postponed_trust_decisions(encryption, sender_key_ids).await
    }

    /// Handle sender keys that became distrusted: their postponed assertions
    /// are dropped without being applied.
    pub async fn handle_sender_keys_distrusted(
        &self,
        encryption: &str,
        sender_key_ids: Vec<KeyId>,
    ) -> Result<()> {
        self.trust.remove_postponed_trust_decisions_by_senders(encryption, sender_key_ids).await
    }
}
