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

//! An SQLite-based store for group chat users and their lifecycle status.

use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool};
use rusqlite::{params_from_iter, types::Value, OptionalExtension, Row, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    types::{GroupChatUser, GroupChatUserEvent, GroupChatUserStatus},
    utils::{create_pool, init, SqliteAsyncConnExt},
    OpenStoreError,
};

/// Page size of the [`SqliteGroupChatStore::users`] listing.
pub const QUERY_LIMIT_GROUP_CHAT_USERS: usize = 20;

/// Capacity of the broadcast channel for group chat user changes.
const UPDATES_CHANNEL_CAPACITY: usize = 64;

/// Read interface to the message archive, which is maintained outside of this
/// store.
///
/// Whether a leaving participant is kept as a `Left` row or pruned depends on
/// whether the account has any stored message of that participant, since
/// message history needs a display name.
#[async_trait]
pub trait MessageLookup: Send + Sync {
    /// Whether the account has any stored message from the given sender in
    /// the given chat.
    async fn has_message(
        &self,
        account_jid: &str,
        chat_jid: &str,
        sender_id: &str,
    ) -> Result<bool>;
}

/// An SQLite-based store for the users of group chats.
///
/// Users are addressable by participant ID, by JID or by both; lookups try
/// the ID first and fall back to the JID, never both at once. The status
/// state machine (`Allowed → Joined → Left`, `Banned` reachable from
/// everywhere) is driven by the protocol event handlers; the store itself
/// rejects no transition.
#[derive(Clone)]
pub struct SqliteGroupChatStore {
    pool: SqlitePool,
    message_lookup: Arc<dyn MessageLookup>,
    updates: broadcast::Sender<GroupChatUserEvent>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteGroupChatStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteGroupChatStore").finish_non_exhaustive()
    }
}

impl SqliteGroupChatStore {
    /// Open the SQLite-based group chat store at the given path.
    pub async fn open(
        path: impl AsRef<Path>,
        message_lookup: Arc<dyn MessageLookup>,
    ) -> Result<Self, OpenStoreError> {
        let pool = create_pool(path.as_ref()).await?;
        Self::open_with_pool(pool, message_lookup).await
    }

    /// Create an SQLite-based group chat store using the given SQLite
    /// database pool, running pending schema migrations.
    pub async fn open_with_pool(
        pool: SqlitePool,
        message_lookup: Arc<dyn MessageLookup>,
    ) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;
        init(&conn).await?;
        debug!("Opened group chat store");

        let (updates, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);
        Ok(Self { pool, message_lookup, updates })
    }

    /// Subscribe to the user changes broadcast by this store.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupChatUserEvent> {
        self.updates.subscribe()
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }

    fn send_events(&self, events: Vec<GroupChatUserEvent>) {
        for event in events {
            let _ = self.updates.send(event);
        }
    }

    /// The user with the given participant ID, if any.
    pub async fn user(
        &self,
        account_jid: &str,
        chat_jid: &str,
        participant_id: &str,
    ) -> Result<Option<GroupChatUser>> {
        let account_jid = account_jid.to_owned();
        let chat_jid = chat_jid.to_owned();
        let participant_id = participant_id.to_owned();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                Ok::<_, Error>(select_user(
                    txn,
                    &account_jid,
                    &chat_jid,
                    UserKey::Id(&participant_id),
                )?)
            })
            .await
    }

    /// One page of the users of the given chat, ordered by (name, status).
    /// The page size is [`QUERY_LIMIT_GROUP_CHAT_USERS`].
    pub async fn users(
        &self,
        account_jid: &str,
        chat_jid: &str,
        offset: usize,
    ) -> Result<Vec<GroupChatUser>> {
        let account_jid = account_jid.to_owned();
        let chat_jid = chat_jid.to_owned();

        Ok(self
            .acquire()
            .await?
            .prepare(
                "SELECT account_jid, chat_jid, id, jid, name, status FROM group_chat_users
                 WHERE account_jid = ? AND chat_jid = ?
                 ORDER BY name, status
                 LIMIT ?, ?",
                move |mut stmt| {
                    stmt.query((
                        account_jid,
                        chat_jid,
                        offset as i64,
                        QUERY_LIMIT_GROUP_CHAT_USERS as i64,
                    ))?
                    .mapped(user_from_row)
                    .collect()
                },
            )
            .await?)
    }

    /// The non-empty JIDs of all users of the given chat.
    pub async fn user_jids(&self, account_jid: &str, chat_jid: &str) -> Result<Vec<String>> {
        let account_jid = account_jid.to_owned();
        let chat_jid = chat_jid.to_owned();

        let jids: Vec<String> = self
            .acquire()
            .await?
            .prepare(
                "SELECT jid FROM group_chat_users WHERE account_jid = ? AND chat_jid = ?",
                move |mut stmt| {
                    stmt.query((account_jid, chat_jid))?.mapped(|row| row.get(0)).collect()
                },
            )
            .await?;

        Ok(jids.into_iter().filter(|jid| !jid.is_empty()).collect())
    }

    /// Handle a user that was allowed to join or banned from the chat; the
    /// caller sets `user.status` accordingly before calling.
    ///
    /// A user already stored under the same JID only has its status updated,
    /// anything else is inserted as a new row.
    #[instrument(skip_all, fields(chat_jid = user.chat_jid))]
    pub async fn handle_user_allowed_or_banned(&self, user: GroupChatUser) -> Result<()> {
        let events = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut events = Vec::new();

                match select_user(txn, &user.account_jid, &user.chat_jid, UserKey::Jid(&user.jid))? {
                    Some(old) => {
                        let mut new = old.clone();
                        new.status = user.status;
                        if update_user(txn, &old, &new, UserKey::Jid(&user.jid))? {
                            events.push(GroupChatUserEvent::Updated(new));
                        }
                    }
                    None => {
                        insert_user(txn, &user)?;
                        events.push(GroupChatUserEvent::JidsChanged {
                            account_jid: user.account_jid.clone(),
                            chat_jid: user.chat_jid.clone(),
                        });
                        events.insert(0, GroupChatUserEvent::Added(user));
                    }
                }

                Ok::<_, Error>(events)
            })
            .await?;

        self.send_events(events);
        Ok(())
    }

    /// Handle a user that was disallowed to join or unbanned; the caller
    /// sets `user.status` to the status being revoked.
    ///
    /// The row is only deleted when its stored status still matches the
    /// revoked one, which guards against racing allow/disallow events
    /// crossing in flight.
    #[instrument(skip_all, fields(chat_jid = user.chat_jid))]
    pub async fn handle_user_disallowed_or_unbanned(&self, user: GroupChatUser) -> Result<()> {
        let events = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut events = Vec::new();

                let stored = txn
                    .query_row(
                        "SELECT account_jid, chat_jid, id, jid, name, status
                         FROM group_chat_users
                         WHERE account_jid = ? AND chat_jid = ? AND jid = ? AND status = ?
                         LIMIT 1",
                        (
                            user.account_jid.as_str(),
                            user.chat_jid.as_str(),
                            user.jid.as_str(),
                            user.status as i64,
                        ),
                        user_from_row,
                    )
                    .optional()?;

                if let Some(stored) = stored {
                    delete_user(txn, &stored)?;
                    events.push(GroupChatUserEvent::JidsChanged {
                        account_jid: stored.account_jid.clone(),
                        chat_jid: stored.chat_jid.clone(),
                    });
                    events.insert(0, GroupChatUserEvent::Removed(stored));
                }

                Ok::<_, Error>(events)
            })
            .await?;

        self.send_events(events);
        Ok(())
    }

    /// Handle a received participant. Its status is forced to `Joined`.
    ///
    /// An already joined participant is updated in place, an allowed but not
    /// yet joined user stored under the participant's JID is merged into a
    /// joined row carrying both identities, and an unknown participant is
    /// inserted.
    #[instrument(skip_all, fields(chat_jid = participant.chat_jid))]
    pub async fn handle_participant_received(&self, mut participant: GroupChatUser) -> Result<()> {
        participant.status = GroupChatUserStatus::Joined;

        let events = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut events = Vec::new();

                if let Some(old) = select_user(
                    txn,
                    &participant.account_jid,
                    &participant.chat_jid,
                    UserKey::Id(&participant.id),
                )? {
                    let mut new = old.clone();
                    new.name = participant.name.clone();
                    new.status = participant.status;
                    if update_user(txn, &old, &new, UserKey::Id(&participant.id))? {
                        events.push(GroupChatUserEvent::Updated(new));
                    }
                } else if let Some(old) = select_user(
                    txn,
                    &participant.account_jid,
                    &participant.chat_jid,
                    UserKey::Jid(&participant.jid),
                )? {
                    let mut new = old.clone();
                    new.id = participant.id.clone();
                    new.name = participant.name.clone();
                    new.status = participant.status;
                    if update_user(txn, &old, &new, UserKey::Jid(&participant.jid))? {
                        events.push(GroupChatUserEvent::Updated(new));
                    }
                } else {
                    insert_user(txn, &participant)?;
                    events.push(GroupChatUserEvent::JidsChanged {
                        account_jid: participant.account_jid.clone(),
                        chat_jid: participant.chat_jid.clone(),
                    });
                    events.insert(0, GroupChatUserEvent::Added(participant));
                }

                Ok::<_, Error>(events)
            })
            .await?;

        self.send_events(events);
        Ok(())
    }

    /// Handle a participant that left the chat.
    ///
    /// The row is kept with status `Left` when the user is on the allow list
    /// or has stored messages; an ephemeral participant with neither is
    /// pruned entirely.
    #[instrument(skip_all, fields(chat_jid = participant.chat_jid))]
    pub async fn handle_participant_left(&self, participant: GroupChatUser) -> Result<()> {
        let has_history = self
            .message_lookup
            .has_message(&participant.account_jid, &participant.chat_jid, &participant.id)
            .await?;

        let events = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut events = Vec::new();

                if let Some(old) = select_user(
                    txn,
                    &participant.account_jid,
                    &participant.chat_jid,
                    UserKey::Id(&participant.id),
                )? {
                    if old.status == GroupChatUserStatus::Allowed || has_history {
                        let mut new = old.clone();
                        new.status = GroupChatUserStatus::Left;
                        if update_user(txn, &old, &new, UserKey::Id(&participant.id))? {
                            events.push(GroupChatUserEvent::Updated(new));
                        }
                    } else {
                        delete_user(txn, &old)?;
                        events.push(GroupChatUserEvent::JidsChanged {
                            account_jid: old.account_jid.clone(),
                            chat_jid: old.chat_jid.clone(),
                        });
                        events.insert(0, GroupChatUserEvent::Removed(old));
                    }
                }

                Ok::<_, Error>(events)
            })
            .await?;

        self.send_events(events);
        Ok(())
    }

    /// Handle the sender of a received message.
    ///
    /// When no row exists for the sender's participant ID, one is inserted
    /// with status `Left` so that historical messages always resolve to a
    /// display name even if the participant event was missed.
    #[instrument(skip_all, fields(chat_jid = sender.chat_jid))]
    pub async fn handle_message_sender(&self, mut sender: GroupChatUser) -> Result<()> {
        let events = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut events = Vec::new();

                if select_user(txn, &sender.account_jid, &sender.chat_jid, UserKey::Id(&sender.id))?
                    .is_none()
                {
                    sender.status = GroupChatUserStatus::Left;
                    insert_user(txn, &sender)?;
                    events.push(GroupChatUserEvent::JidsChanged {
                        account_jid: sender.account_jid.clone(),
                        chat_jid: sender.chat_jid.clone(),
                    });
                    events.insert(0, GroupChatUserEvent::Added(sender));
                }

                Ok::<_, Error>(events)
            })
            .await?;

        self.send_events(events);
        Ok(())
    }

    /// Remove all users of the given account, on account removal.
    pub async fn remove_users(&self, account_jid: &str) -> Result<()> {
        let account_jid = account_jid.to_owned();

        self.acquire()
            .await?
            .execute("DELETE FROM group_chat_users WHERE account_jid = ?", (account_jid,))
            .await?;
        Ok(())
    }

    /// Remove all users of the given chat, on chat removal.
    pub async fn remove_users_in_chat(&self, account_jid: &str, chat_jid: &str) -> Result<()> {
        let account_jid = account_jid.to_owned();
        let chat_jid = chat_jid.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM group_chat_users WHERE account_jid = ? AND chat_jid = ?",
                (account_jid, chat_jid),
            )
            .await?;
        Ok(())
    }
}

/// The identity channel a user is looked up by. A lookup tries the ID first
/// and falls back to the JID, never both at once.
#[derive(Clone, Copy)]
enum UserKey<'a> {
    Id(&'a str),
    Jid(&'a str),
}

impl UserKey<'_> {
    fn column(&self) -> &'static str {
        match self {
            UserKey::Id(_) => "id",
            UserKey::Jid(_) => "jid",
        }
    }

    fn value(&self) -> &str {
        match self {
            UserKey::Id(value) | UserKey::Jid(value) => value,
        }
    }
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<GroupChatUser> {
    let status_value = row.get::<_, i64>(5)?;
    let status = GroupChatUserStatus::from_sql(status_value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Integer,
            Box::new(rusqlite::types::FromSqlError::OutOfRange(status_value)),
        )
    })?;

    Ok(GroupChatUser {
        account_jid: row.get(0)?,
        chat_jid: row.get(1)?,
        id: row.get(2)?,
        jid: row.get(3)?,
        name: row.get(4)?,
        status,
    })
}

fn select_user(
    txn: &Transaction<'_>,
    account_jid: &str,
    chat_jid: &str,
    key: UserKey<'_>,
) -> rusqlite::Result<Option<GroupChatUser>> {
    // An absent identity channel is stored as the empty string; looking it up
    // would cross-match unrelated rows.
    if key.value().is_empty() {
        return Ok(None);
    }

    let sql = format!(
        "SELECT account_jid, chat_jid, id, jid, name, status FROM group_chat_users
         WHERE account_jid = ? AND chat_jid = ? AND {} = ?
         LIMIT 1",
        key.column()
    );
    txn.query_row(&sql, (account_jid, chat_jid, key.value()), user_from_row).optional()
}

fn insert_user(txn: &Transaction<'_>, user: &GroupChatUser) -> rusqlite::Result<()> {
    txn.execute(
        "INSERT INTO group_chat_users (account_jid, chat_jid, id, jid, name, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            user.account_jid.as_str(),
            user.chat_jid.as_str(),
            user.id.as_str(),
            user.jid.as_str(),
            user.name.as_str(),
            user.status as i64,
        ),
    )?;
    Ok(())
}

/// Write the column-level diff between the old and new record, returning
/// whether anything was written. A record with no changed columns
/// short-circuits without touching the database.
fn update_user(
    txn: &Transaction<'_>,
    old: &GroupChatUser,
    new: &GroupChatUser,
    key: UserKey<'_>,
) -> rusqlite::Result<bool> {
    let mut assignments = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if old.id != new.id {
        assignments.push("id = ?");
        params.push(new.id.clone().into());
    }
    if old.jid != new.jid {
        assignments.push("jid = ?");
        params.push(new.jid.clone().into());
    }
    if old.name != new.name {
        assignments.push("name = ?");
        params.push(new.name.clone().into());
    }
    if old.status != new.status {
        assignments.push("status = ?");
        params.push((new.status as i64).into());
    }

    if assignments.is_empty() {
        return Ok(false);
    }

    let sql = format!(
        "UPDATE group_chat_users SET {} WHERE account_jid = ? AND chat_jid = ? AND {} = ?",
        assignments.join(", "),
        key.column()
    );
    params.push(old.account_jid.clone().into());
    params.push(old.chat_jid.clone().into());
    params.push(key.value().to_owned().into());

    txn.execute(&sql, params_from_iter(params))?;
    Ok(true)
}

/// Delete a user row, keyed by its participant ID when it has one and by its
/// JID otherwise.
fn delete_user(txn: &Transaction<'_>, user: &GroupChatUser) -> rusqlite::Result<()> {
    let key =
        if user.id.is_empty() { UserKey::Jid(&user.jid) } else { UserKey::Id(&user.id) };
    let sql = format!(
        "DELETE FROM group_chat_users WHERE account_jid = ? AND chat_jid = ? AND {} = ?",
        key.column()
    );
    txn.execute(&sql, (user.account_jid.as_str(), user.chat_jid.as_str(), key.value()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use once_cell::sync::Lazy;
    use tempfile::{tempdir, TempDir};

    use super::{MessageLookup, SqliteGroupChatStore};
    use crate::{
        error::Result,
        types::{GroupChatUser, GroupChatUserEvent, GroupChatUserStatus},
    };

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());

    const ACCOUNT: &str = "alice@example.org";
    const CHAT: &str = "chat@rooms.example.org";

    struct FixedMessageLookup(bool);

    #[async_trait]
    impl MessageLookup for FixedMessageLookup {
        async fn has_message(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    async fn get_store(name: &str, has_messages: bool) -> SqliteGroupChatStore {
        let tmpdir_path = TMP_DIR.path().join(name);
        SqliteGroupChatStore::open(tmpdir_path, Arc::new(FixedMessageLookup(has_messages)))
            .await
            .unwrap()
    }

    fn participant(id: &str, jid: &str, name: &str) -> GroupChatUser {
        GroupChatUser {
            account_jid: ACCOUNT.to_owned(),
            chat_jid: CHAT.to_owned(),
            id: id.to_owned(),
            jid: jid.to_owned(),
            name: name.to_owned(),
            status: GroupChatUserStatus::Joined,
        }
    }

    fn allowed_user(jid: &str) -> GroupChatUser {
        GroupChatUser {
            account_jid: ACCOUNT.to_owned(),
            chat_jid: CHAT.to_owned(),
            id: String::new(),
            jid: jid.to_owned(),
            name: String::new(),
            status: GroupChatUserStatus::Allowed,
        }
    }

    #[tokio::test]
    async fn participant_received_twice_updates_in_place() {
        let store = get_store("participant_received_twice_updates_in_place", false).await;
        let mut updates = store.subscribe();

        store.handle_participant_received(participant("p1", "bob@example.org", "Bob")).await.unwrap();
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::Added(_));
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::JidsChanged { .. });

        store
            .handle_participant_received(participant("p1", "bob@example.org", "Bobby"))
            .await
            .unwrap();
        let updated = assert_matches!(
            updates.try_recv().unwrap(),
            GroupChatUserEvent::Updated(user) => user
        );
        assert_eq!(updated.name, "Bobby");
        assert!(updates.try_recv().is_err());

        let users = store.users(ACCOUNT, CHAT, 0).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Bobby");
        assert_eq!(users[0].status, GroupChatUserStatus::Joined);

        // An identical event changes nothing and emits nothing.
        store
            .handle_participant_received(participant("p1", "bob@example.org", "Bobby"))
            .await
            .unwrap();
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn participant_received_merges_allowed_user() {
        let store = get_store("participant_received_merges_allowed_user", false).await;

        store.handle_user_allowed_or_banned(allowed_user("bob@example.org")).await.unwrap();
        store.handle_participant_received(participant("p1", "bob@example.org", "Bob")).await.unwrap();

        let users = store.users(ACCOUNT, CHAT, 0).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "p1");
        assert_eq!(users[0].jid, "bob@example.org");
        assert_eq!(users[0].status, GroupChatUserStatus::Joined);

        let user = store.user(ACCOUNT, CHAT, "p1").await.unwrap().unwrap();
        assert_eq!(user.jid, "bob@example.org");
    }

    #[tokio::test]
    async fn participant_left_with_history_is_kept() {
        let store = get_store("participant_left_with_history_is_kept", true).await;

        store.handle_participant_received(participant("p1", "bob@example.org", "Bob")).await.unwrap();
        store.handle_participant_left(participant("p1", "bob@example.org", "Bob")).await.unwrap();

        let user = store.user(ACCOUNT, CHAT, "p1").await.unwrap().unwrap();
        assert_eq!(user.status, GroupChatUserStatus::Left);
    }

    #[tokio::test]
    async fn ephemeral_participant_left_is_pruned() {
        let store = get_store("ephemeral_participant_left_is_pruned", false).await;
        let mut updates = store.subscribe();

        // Anonymous participant without JID, no allow-list entry, no history.
        store.handle_participant_received(participant("p1", "", "Bob")).await.unwrap();
        let _ = updates.try_recv();
        let _ = updates.try_recv();

        store.handle_participant_left(participant("p1", "", "Bob")).await.unwrap();

        assert!(store.user(ACCOUNT, CHAT, "p1").await.unwrap().is_none());
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::Removed(_));
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::JidsChanged { .. });
    }

    #[tokio::test]
    async fn allowed_participant_left_is_kept() {
        let store = get_store("allowed_participant_left_is_kept", false).await;

        let mut allowed = allowed_user("bob@example.org");
        allowed.id = "p1".to_owned();
        store.handle_user_allowed_or_banned(allowed).await.unwrap();

        store.handle_participant_left(participant("p1", "bob@example.org", "Bob")).await.unwrap();

        let user = store.user(ACCOUNT, CHAT, "p1").await.unwrap().unwrap();
        assert_eq!(user.status, GroupChatUserStatus::Left);
    }

    #[tokio::test]
    async fn message_sender_is_backfilled_with_left_status() {
        let store = get_store("message_sender_is_backfilled_with_left_status", false).await;
        let mut updates = store.subscribe();

        store.handle_message_sender(participant("p1", "", "Bob")).await.unwrap();

        let user = store.user(ACCOUNT, CHAT, "p1").await.unwrap().unwrap();
        assert_eq!(user.status, GroupChatUserStatus::Left);
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::Added(_));

        // A known sender is left untouched.
        store.handle_participant_received(participant("p2", "", "Carol")).await.unwrap();
        store.handle_message_sender(participant("p2", "", "Carol")).await.unwrap();
        let user = store.user(ACCOUNT, CHAT, "p2").await.unwrap().unwrap();
        assert_eq!(user.status, GroupChatUserStatus::Joined);
    }

    #[tokio::test]
    async fn disallowed_only_removes_matching_status() {
        let store = get_store("disallowed_only_removes_matching_status", false).await;
        let mut updates = store.subscribe();

        store.handle_user_allowed_or_banned(allowed_user("bob@example.org")).await.unwrap();
        let _ = updates.try_recv();
        let _ = updates.try_recv();

        // An unban for a user that is merely allowed is a no-op.
        let mut unbanned = allowed_user("bob@example.org");
        unbanned.status = GroupChatUserStatus::Banned;
        store.handle_user_disallowed_or_unbanned(unbanned).await.unwrap();
        assert_eq!(store.users(ACCOUNT, CHAT, 0).await.unwrap().len(), 1);
        assert!(updates.try_recv().is_err());

        store.handle_user_disallowed_or_unbanned(allowed_user("bob@example.org")).await.unwrap();
        assert!(store.users(ACCOUNT, CHAT, 0).await.unwrap().is_empty());
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::Removed(_));
        assert_matches!(updates.try_recv().unwrap(), GroupChatUserEvent::JidsChanged { .. });
    }

    #[tokio::test]
    async fn user_jids_skips_empty_jids() {
        let store = get_store("user_jids_skips_empty_jids", false).await;

        store.handle_user_allowed_or_banned(allowed_user("bob@example.org")).await.unwrap();
        store.handle_participant_received(participant("p1", "", "Anonymous")).await.unwrap();

        let jids = store.user_jids(ACCOUNT, CHAT).await.unwrap();
        assert_eq!(jids, vec!["bob@example.org".to_owned()]);
    }

    #[tokio::test]
    async fn banned_user_keeps_single_row() {
        let store = get_store("banned_user_keeps_single_row", false).await;

        store.handle_user_allowed_or_banned(allowed_user("bob@example.org")).await.unwrap();

        let mut banned = allowed_user("bob@example.org");
        banned.status = GroupChatUserStatus::Banned;
        store.handle_user_allowed_or_banned(banned).await.unwrap();

        let users = store.users(ACCOUNT, CHAT, 0).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].status, GroupChatUserStatus::Banned);
    }

    #[tokio::test]
    async fn remove_users_clears_chat() {
        let store = get_store("remove_users_clears_chat", false).await;

        store.handle_participant_received(participant("p1", "bob@example.org", "Bob")).await.unwrap();
        store
            .handle_participant_received({
                let mut other = participant("p2", "carol@example.org", "Carol");
                other.chat_jid = "other@rooms.example.org".to_owned();
                other
            })
            .await
            .unwrap();

        store.remove_users_in_chat(ACCOUNT, CHAT).await.unwrap();
        assert!(store.users(ACCOUNT, CHAT, 0).await.unwrap().is_empty());
        assert_eq!(store.users(ACCOUNT, "other@rooms.example.org", 0).await.unwrap().len(), 1);

        store.remove_users(ACCOUNT).await.unwrap();
        assert!(store.users(ACCOUNT, "other@rooms.example.org", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn users_are_ordered_by_name() {
        let store = get_store("users_are_ordered_by_name", false).await;

        store.handle_participant_received(participant("p2", "", "Zoe")).await.unwrap();
        store.handle_participant_received(participant("p1", "", "Amy")).await.unwrap();

        let users = store.users(ACCOUNT, CHAT, 0).await.unwrap();
        let names: Vec<_> = users.iter().map(|user| user.name.as_str()).collect();
        assert_eq!(names, vec!["Amy", "Zoe"]);
    }
}
