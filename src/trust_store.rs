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

//! An SQLite-based store for end-to-end trust levels and postponed trust
//! decisions.

use std::{collections::HashMap, fmt, path::Path};

use deadpool_sqlite::{Object as SqliteAsyncConn, Pool as SqlitePool};
use rusqlite::{params_from_iter, types::Value, OptionalExtension, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::{
    error::{Error, Result},
    types::{
        KeyId, OwnerKeyIds, PostponedTrustDecisions, SecurityPolicy, TrustChanges, TrustEvent,
        TrustLevel, TrustLevels, TrustMessageKeyOwner,
    },
    utils::{create_pool, init, repeat_vars, SqliteAsyncConnExt},
    OpenStoreError,
};

/// Capacity of the broadcast channel for trust changes.
const UPDATES_CHANNEL_CAPACITY: usize = 64;

/// An SQLite-based trust store, scoped to a single local account.
///
/// It persists the trust level of every known encryption key, the local
/// account's own key and security policy per encryption scheme, and a ledger
/// of trust decisions that are postponed until their sender key is
/// authenticated.
///
/// A key that was never stored has the virtual trust level
/// [`TrustLevel::Undecided`].
#[derive(Clone)]
pub struct SqliteTrustStore {
    pool: SqlitePool,
    account_jid: String,
    updates: broadcast::Sender<TrustEvent>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SqliteTrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTrustStore")
            .field("account_jid", &self.account_jid)
            .finish_non_exhaustive()
    }
}

impl SqliteTrustStore {
    /// Open the SQLite-based trust store at the given path for the given
    /// local account.
    pub async fn open(
        path: impl AsRef<Path>,
        account_jid: &str,
    ) -> Result<Self, OpenStoreError> {
        let pool = create_pool(path.as_ref()).await?;
        Self::open_with_pool(pool, account_jid).await
    }

    /// Create an SQLite-based trust store using the given SQLite database
    /// pool, running pending schema migrations.
    pub async fn open_with_pool(
        pool: SqlitePool,
        account_jid: &str,
    ) -> Result<Self, OpenStoreError> {
        let conn = pool.get().await?;
        init(&conn).await?;
        debug!(account_jid, "Opened trust store");

        let (updates, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);
        Ok(Self { pool, account_jid: account_jid.to_owned(), updates })
    }

    /// Subscribe to the trust changes broadcast by this store.
    pub fn subscribe(&self) -> broadcast::Receiver<TrustEvent> {
        self.updates.subscribe()
    }

    async fn acquire(&self) -> Result<SqliteAsyncConn> {
        Ok(self.pool.get().await?)
    }

    fn emit_changes(&self, changes: &TrustChanges) {
        if changes.values().any(|pairs| !pairs.is_empty()) {
            let _ = self.updates.send(TrustEvent::KeysChanged { changes: changes.clone() });
        }
    }

    /// The security policy of the given encryption scheme, defaulting to
    /// [`SecurityPolicy::NoSecurityPolicy`] when none is stored.
    pub async fn security_policy(&self, encryption: &str) -> Result<SecurityPolicy> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        let value = self
            .acquire()
            .await?
            .query_row(
                "SELECT security_policy FROM trust_security_policies
                 WHERE account = ? AND encryption = ?",
                (account, encryption),
                |row| row.get::<_, i64>(0),
            )
            .await
            .optional()?;

        Ok(value.and_then(SecurityPolicy::from_sql).unwrap_or_default())
    }

    /// Set the security policy of the given encryption scheme. Idempotent.
    pub async fn set_security_policy(
        &self,
        encryption: &str,
        security_policy: SecurityPolicy,
    ) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "INSERT OR REPLACE INTO trust_security_policies
                 (account, encryption, security_policy) VALUES (?1, ?2, ?3)",
                (account, encryption, security_policy as i64),
            )
            .await?;
        Ok(())
    }

    /// Remove the stored security policy of the given encryption scheme.
    pub async fn reset_security_policy(&self, encryption: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM trust_security_policies WHERE account = ? AND encryption = ?",
                (account, encryption),
            )
            .await?;
        Ok(())
    }

    /// The local account's own key for the given encryption scheme, empty if
    /// none is stored.
    pub async fn own_key(&self, encryption: &str) -> Result<KeyId> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        let key_id = self
            .acquire()
            .await?
            .query_row(
                "SELECT key_id FROM trust_own_keys WHERE account = ? AND encryption = ?",
                (account, encryption),
                |row| row.get::<_, KeyId>(0),
            )
            .await
            .optional()?;

        Ok(key_id.unwrap_or_default())
    }

    /// Set the local account's own key for the given encryption scheme.
    pub async fn set_own_key(&self, encryption: &str, key_id: KeyId) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "INSERT OR REPLACE INTO trust_own_keys (account, encryption, key_id)
                 VALUES (?1, ?2, ?3)",
                (account, encryption, key_id),
            )
            .await?;
        Ok(())
    }

    /// Remove the local account's own key for the given encryption scheme.
    pub async fn reset_own_key(&self, encryption: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM trust_own_keys WHERE account = ? AND encryption = ?",
                (account, encryption),
            )
            .await?;
        Ok(())
    }

    /// All keys of the given encryption scheme, grouped by trust level and
    /// key owner.
    ///
    /// An empty `trust_levels` mask means "all levels". A mask consisting of
    /// only [`TrustLevel::Undecided`] matches nothing, since that level is
    /// never stored.
    pub async fn keys(
        &self,
        encryption: &str,
        trust_levels: TrustLevels,
    ) -> Result<HashMap<TrustLevel, OwnerKeyIds>> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let levels = trust_levels.stored_levels();
        if !trust_levels.is_empty() && levels.is_empty() {
            // Only the virtual Undecided level was given; no stored key can match.
            return Ok(HashMap::new());
        }

        let rows: Vec<(KeyId, String, i64)> = if levels.is_empty() {
            self.acquire()
                .await?
                .prepare(
                    "SELECT key_id, owner_jid, trust_level FROM trust_keys
                     WHERE account = ? AND encryption = ?",
                    move |mut stmt| {
                        stmt.query((account, encryption))?
                            .mapped(|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                            .collect()
                    },
                )
                .await?
        } else {
            let sql = format!(
                "SELECT key_id, owner_jid, trust_level FROM trust_keys
                 WHERE account = ? AND encryption = ? AND trust_level IN ({})",
                repeat_vars(levels.len())
            );
            self.acquire()
                .await?
                .prepare(sql, move |mut stmt| {
                    let mut params: Vec<Value> = vec![account.into(), encryption.into()];
                    params.extend(levels.into_iter().map(Value::from));
                    stmt.query(params_from_iter(params))?
                        .mapped(|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                        .collect()
                })
                .await?
        };

        let mut output: HashMap<TrustLevel, OwnerKeyIds> = HashMap::new();
        for (key_id, owner_jid, level) in rows {
            let Some(level) = TrustLevel::from_sql(level) else {
                warn!(level, "Skipping key with unknown trust level");
                continue;
            };
            output.entry(level).or_default().entry(owner_jid).or_default().push(key_id);
        }
        Ok(output)
    }

    /// The keys of the given owners for the given encryption scheme, mapped
    /// to their trust level. One query is issued per owner JID; owners
    /// without matching keys are absent from the result.
    ///
    /// An empty `trust_levels` mask means "all levels". A mask consisting of
    /// only [`TrustLevel::Undecided`] matches nothing, since that level is
    /// never stored.
    pub async fn keys_by_owner(
        &self,
        encryption: &str,
        key_owner_jids: Vec<String>,
        trust_levels: TrustLevels,
    ) -> Result<HashMap<String, HashMap<KeyId, TrustLevel>>> {
        assert!(!key_owner_jids.is_empty(), "At least one key owner JID must be given");

        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let levels = trust_levels.stored_levels();
        if !trust_levels.is_empty() && levels.is_empty() {
            // Only the virtual Undecided level was given; no stored key can match.
            return Ok(HashMap::new());
        }

        let sql = if levels.is_empty() {
            "SELECT key_id, trust_level FROM trust_keys
             WHERE account = ? AND encryption = ? AND owner_jid = ?"
                .to_owned()
        } else {
            format!(
                "SELECT key_id, trust_level FROM trust_keys
                 WHERE account = ? AND encryption = ? AND owner_jid = ? AND trust_level IN ({})",
                repeat_vars(levels.len())
            )
        };

        let rows: Vec<(String, KeyId, i64)> = self
            .acquire()
            .await?
            .prepare(sql, move |mut stmt| {
                let mut rows = Vec::new();
                for owner_jid in key_owner_jids {
                    let mut params: Vec<Value> =
                        vec![account.clone().into(), encryption.clone().into(), owner_jid.clone().into()];
                    params.extend(levels.iter().copied().map(Value::from));

                    let owner_rows = stmt
                        .query(params_from_iter(params))?
                        .mapped(|row| Ok((row.get::<_, KeyId>(0)?, row.get::<_, i64>(1)?)))
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows.extend(
                        owner_rows
                            .into_iter()
                            .map(|(key_id, level)| (owner_jid.clone(), key_id, level)),
                    );
                }
                Ok(rows)
            })
            .await?;

        let mut output: HashMap<String, HashMap<KeyId, TrustLevel>> = HashMap::new();
        for (owner_jid, key_id, level) in rows {
            let Some(level) = TrustLevel::from_sql(level) else {
                warn!(level, "Skipping key with unknown trust level");
                continue;
            };
            output.entry(owner_jid).or_default().insert(key_id, level);
        }
        Ok(output)
    }

    /// Store the given keys of one owner at the given trust level,
    /// overwriting any previous level of the same keys.
    pub async fn add_keys(
        &self,
        encryption: &str,
        key_owner_jid: &str,
        key_ids: Vec<KeyId>,
        trust_level: TrustLevel,
    ) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let key_owner_jid = key_owner_jid.to_owned();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                for key_id in key_ids {
                    insert_key(txn, &account, &encryption, &key_owner_jid, &key_id, trust_level)?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    /// Remove the given keys of the given encryption scheme, whoever owns
    /// them.
    pub async fn remove_keys(&self, encryption: &str, key_ids: Vec<KeyId>) -> Result<()> {
        if key_ids.is_empty() {
            return Ok(());
        }

        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let sql = format!(
            "DELETE FROM trust_keys
             WHERE account = ? AND encryption = ? AND key_id IN ({})",
            repeat_vars(key_ids.len())
        );

        self.acquire()
            .await?
            .prepare(sql, move |mut stmt| {
                let mut params: Vec<Value> = vec![account.into(), encryption.into()];
                params.extend(key_ids.into_iter().map(Value::from));
                stmt.execute(params_from_iter(params))?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Remove all keys of the given owner for the given encryption scheme.
    pub async fn remove_keys_by_owner(&self, encryption: &str, key_owner_jid: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let key_owner_jid = key_owner_jid.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM trust_keys
                 WHERE account = ? AND encryption = ? AND owner_jid = ?",
                (account, encryption, key_owner_jid),
            )
            .await?;
        Ok(())
    }

    /// Remove all keys of the given encryption scheme.
    pub async fn remove_all_keys(&self, encryption: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM trust_keys WHERE account = ? AND encryption = ?",
                (account, encryption),
            )
            .await?;
        Ok(())
    }

    /// Whether the given owner has at least one key at one of the given
    /// trust levels. The mask must not be empty.
    pub async fn has_key(
        &self,
        encryption: &str,
        key_owner_jid: &str,
        trust_levels: TrustLevels,
    ) -> Result<bool> {
        assert!(!trust_levels.is_empty(), "The trust levels mask must not be empty");

        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let key_owner_jid = key_owner_jid.to_owned();
        let levels = trust_levels.stored_levels();
        if levels.is_empty() {
            // Only the virtual Undecided level was given; no stored key can match.
            return Ok(false);
        }

        let sql = format!(
            "SELECT COUNT(*) FROM trust_keys
             WHERE account = ? AND encryption = ? AND owner_jid = ? AND trust_level IN ({})",
            repeat_vars(levels.len())
        );

        let count: i64 = self
            .acquire()
            .await?
            .prepare(sql, move |mut stmt| {
                let mut params: Vec<Value> =
                    vec![account.into(), encryption.into(), key_owner_jid.into()];
                params.extend(levels.into_iter().map(Value::from));
                stmt.query_row(params_from_iter(params), |row| row.get(0))
            })
            .await?;
        Ok(count > 0)
    }

    /// The trust level of the given key, [`TrustLevel::Undecided`] when the
    /// key is not stored.
    pub async fn trust_level(
        &self,
        encryption: &str,
        key_owner_jid: &str,
        key_id: &[u8],
    ) -> Result<TrustLevel> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let key_owner_jid = key_owner_jid.to_owned();
        let key_id = key_id.to_owned();

        let level = self
            .acquire()
            .await?
            .query_row(
                "SELECT trust_level FROM trust_keys
                 WHERE account = ? AND encryption = ? AND owner_jid = ? AND key_id = ?",
                (account, encryption, key_owner_jid, key_id),
                |row| row.get::<_, i64>(0),
            )
            .await
            .optional()?;

        Ok(level.and_then(TrustLevel::from_sql).unwrap_or(TrustLevel::Undecided))
    }

    /// Set the trust level of the given (owner, key) pairs.
    ///
    /// A pair stored at a different level is updated, a pair not stored at
    /// all is inserted at the new level; both count as changed. A pair
    /// already at the new level is left untouched and excluded from the
    /// returned changes.
    #[instrument(skip(self, key_ids))]
    pub async fn set_trust_level(
        &self,
        encryption: &str,
        key_ids: Vec<(String, KeyId)>,
        trust_level: TrustLevel,
    ) -> Result<TrustChanges> {
        let account = self.account_jid.clone();
        let encryption_owned = encryption.to_owned();

        let changed: OwnerKeyIds = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut changed = OwnerKeyIds::new();
                for (owner_jid, key_id) in key_ids {
                    if upsert_trust_level(
                        txn,
                        &account,
                        &encryption_owned,
                        &owner_jid,
                        &key_id,
                        trust_level,
                    )? {
                        changed.entry(owner_jid).or_default().push(key_id);
                    }
                }
                Ok::<_, Error>(changed)
            })
            .await?;

        let mut changes = TrustChanges::new();
        changes.insert(encryption.to_owned(), changed);
        self.emit_changes(&changes);
        Ok(changes)
    }

    /// Move all keys of the given owners that are currently at exactly
    /// `old_trust_level` to `new_trust_level`.
    ///
    /// Keys at other levels are untouched, and unlike [`Self::set_trust_level`]
    /// no key is inserted.
    #[instrument(skip(self, key_owner_jids))]
    pub async fn set_trust_level_transition(
        &self,
        encryption: &str,
        key_owner_jids: Vec<String>,
        old_trust_level: TrustLevel,
        new_trust_level: TrustLevel,
    ) -> Result<TrustChanges> {
        let account = self.account_jid.clone();
        let encryption_owned = encryption.to_owned();

        let changed: OwnerKeyIds = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut changed = OwnerKeyIds::new();
                let mut update_row_ids = Vec::new();

                let mut stmt = txn.prepare(
                    "SELECT rowid, key_id FROM trust_keys
                     WHERE account = ? AND encryption = ? AND owner_jid = ? AND trust_level = ?",
                )?;
                for owner_jid in key_owner_jids {
                    let rows = stmt
                        .query((
                            account.as_str(),
                            encryption_owned.as_str(),
                            owner_jid.as_str(),
                            old_trust_level as u8,
                        ))?
                        .mapped(|row| Ok((row.get::<_, i64>(0)?, row.get::<_, KeyId>(1)?)))
                        .collect::<rusqlite::Result<Vec<_>>>()?;

                    for (row_id, key_id) in rows {
                        update_row_ids.push(row_id);
                        changed.entry(owner_jid.clone()).or_default().push(key_id);
                    }
                }
                drop(stmt);

                for row_id in update_row_ids {
                    txn.execute(
                        "UPDATE trust_keys SET trust_level = ? WHERE rowid = ?",
                        (new_trust_level as u8, row_id),
                    )?;
                }
                Ok::<_, Error>(changed)
            })
            .await?;

        let mut changes = TrustChanges::new();
        changes.insert(encryption.to_owned(), changed);
        self.emit_changes(&changes);
        Ok(changes)
    }

    /// Store trust and distrust assertions whose sender key is not yet
    /// trusted, to be applied once that key is authenticated.
    ///
    /// A key listed in both the trusted and distrusted set of the same owner
    /// yields two independent ledger rows; the ledger never adjudicates such
    /// conflicts.
    pub async fn add_keys_for_postponed_trust_decisions(
        &self,
        encryption: &str,
        sender_key_id: &[u8],
        key_owners: Vec<TrustMessageKeyOwner>,
    ) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();
        let sender_key_id = sender_key_id.to_owned();

        let mut rows: Vec<(KeyId, String, bool)> = Vec::with_capacity(
            key_owners
                .iter()
                .map(|owner| owner.trusted_keys.len() + owner.distrusted_keys.len())
                .sum(),
        );
        for key_owner in key_owners {
            rows.extend(key_owner.trusted_keys.into_iter().map(|id| (id, key_owner.jid.clone(), true)));
            rows.extend(
                key_owner.distrusted_keys.into_iter().map(|id| (id, key_owner.jid.clone(), false)),
            );
        }

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                let mut stmt = txn.prepare(
                    "INSERT OR REPLACE INTO trust_keys_unprocessed
                     (account, encryption, key_id, owner_jid, sender_key_id, trust)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (key_id, owner_jid, trust) in rows {
                    stmt.execute((
                        account.as_str(),
                        encryption.as_str(),
                        key_id,
                        owner_jid,
                        sender_key_id.as_slice(),
                        trust,
                    ))?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    /// Remove postponed rows by key ID and trust flag: rows flagged for
    /// trusting are matched against `trusted_key_ids`, rows flagged for
    /// distrusting against `distrusted_key_ids`.
    pub async fn remove_keys_for_postponed_trust_decisions(
        &self,
        encryption: &str,
        trusted_key_ids: Vec<KeyId>,
        distrusted_key_ids: Vec<KeyId>,
    ) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        let mut selectors: Vec<(KeyId, bool)> =
            Vec::with_capacity(trusted_key_ids.len() + distrusted_key_ids.len());
        selectors.extend(trusted_key_ids.into_iter().map(|id| (id, true)));
        selectors.extend(distrusted_key_ids.into_iter().map(|id| (id, false)));

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                let mut stmt = txn.prepare(
                    "DELETE FROM trust_keys_unprocessed
                     WHERE account = ? AND encryption = ? AND key_id = ? AND trust = ?",
                )?;
                for (key_id, trust) in selectors {
                    stmt.execute((account.as_str(), encryption.as_str(), key_id, trust))?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    /// Remove all postponed rows attached to the given sender keys.
    pub async fn remove_postponed_trust_decisions_by_senders(
        &self,
        encryption: &str,
        sender_key_ids: Vec<KeyId>,
    ) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                let mut stmt = txn.prepare(
                    "DELETE FROM trust_keys_unprocessed
                     WHERE account = ? AND encryption = ? AND sender_key_id = ?",
                )?;
                for sender_key_id in sender_key_ids {
                    stmt.execute((account.as_str(), encryption.as_str(), sender_key_id))?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    /// Remove all postponed rows of the given encryption scheme.
    pub async fn remove_all_postponed_trust_decisions(&self, encryption: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .execute(
                "DELETE FROM trust_keys_unprocessed WHERE account = ? AND encryption = ?",
                (account, encryption),
            )
            .await?;
        Ok(())
    }

    /// The postponed trust decisions attached to the given sender keys, or
    /// all postponed decisions of the scheme when `sender_key_ids` is empty.
    pub async fn keys_for_postponed_trust_decisions(
        &self,
        encryption: &str,
        sender_key_ids: Vec<KeyId>,
    ) -> Result<PostponedTrustDecisions> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        let rows: Vec<(KeyId, String, bool)> = if sender_key_ids.is_empty() {
            self.acquire()
                .await?
                .prepare(
                    "SELECT key_id, owner_jid, trust FROM trust_keys_unprocessed
                     WHERE account = ? AND encryption = ?",
                    move |mut stmt| {
                        stmt.query((account, encryption))?
                            .mapped(|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                            .collect()
                    },
                )
                .await?
        } else {
            self.acquire()
                .await?
                .prepare(
                    "SELECT key_id, owner_jid, trust FROM trust_keys_unprocessed
                     WHERE account = ? AND encryption = ? AND sender_key_id = ?",
                    move |mut stmt| {
                        let mut rows = Vec::new();
                        for sender_key_id in sender_key_ids {
                            let sender_rows = stmt
                                .query((account.as_str(), encryption.as_str(), sender_key_id))?
                                .mapped(|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                                .collect::<rusqlite::Result<Vec<_>>>()?;
                            rows.extend(sender_rows);
                        }
                        Ok(rows)
                    },
                )
                .await?
        };

        let mut result = PostponedTrustDecisions::default();
        for (key_id, owner_jid, trust) in rows {
            let side = if trust { &mut result.to_trust } else { &mut result.to_distrust };
            side.entry(owner_jid).or_default().push(key_id);
        }
        Ok(result)
    }

    /// Apply all postponed decisions of the given sender keys and purge
    /// their ledger rows, as a single transaction.
    ///
    /// Rows flagged for trusting move their key to
    /// [`TrustLevel::Authenticated`], rows flagged for distrusting to
    /// [`TrustLevel::ManuallyDistrusted`]. Purging in the same transaction
    /// guarantees that a decision is never applied twice.
    #[instrument(skip(self, sender_key_ids))]
    pub async fn apply_postponed_trust_decisions(
        &self,
        encryption: &str,
        sender_key_ids: Vec<KeyId>,
    ) -> Result<TrustChanges> {
        let account = self.account_jid.clone();
        let encryption_owned = encryption.to_owned();

        let changed: OwnerKeyIds = self
            .acquire()
            .await?
            .with_transaction(move |txn| {
                let mut rows: Vec<(KeyId, String, bool)> = Vec::new();
                {
                    let mut stmt = txn.prepare(
                        "SELECT key_id, owner_jid, trust FROM trust_keys_unprocessed
                         WHERE account = ? AND encryption = ? AND sender_key_id = ?",
                    )?;
                    for sender_key_id in &sender_key_ids {
                        let sender_rows = stmt
                            .query((
                                account.as_str(),
                                encryption_owned.as_str(),
                                sender_key_id.as_slice(),
                            ))?
                            .mapped(|row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows.extend(sender_rows);
                    }
                }

                let mut changed = OwnerKeyIds::new();
                for (key_id, owner_jid, trust) in rows {
                    let trust_level = if trust {
                        TrustLevel::Authenticated
                    } else {
                        TrustLevel::ManuallyDistrusted
                    };
                    if upsert_trust_level(
                        txn,
                        &account,
                        &encryption_owned,
                        &owner_jid,
                        &key_id,
                        trust_level,
                    )? {
                        changed.entry(owner_jid).or_default().push(key_id);
                    }
                }

                let mut stmt = txn.prepare(
                    "DELETE FROM trust_keys_unprocessed
                     WHERE account = ? AND encryption = ? AND sender_key_id = ?",
                )?;
                for sender_key_id in sender_key_ids {
                    stmt.execute((account.as_str(), encryption_owned.as_str(), sender_key_id))?;
                }

                Ok::<_, Error>(changed)
            })
            .await?;

        let mut changes = TrustChanges::new();
        changes.insert(encryption.to_owned(), changed);
        self.emit_changes(&changes);
        Ok(changes)
    }

    /// Remove all trust data of the given encryption scheme: keys, postponed
    /// decisions, the own key and the security policy. Other schemes are
    /// untouched.
    pub async fn reset_all(&self, encryption: &str) -> Result<()> {
        let account = self.account_jid.clone();
        let encryption = encryption.to_owned();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                for table in [
                    "trust_security_policies",
                    "trust_own_keys",
                    "trust_keys",
                    "trust_keys_unprocessed",
                ] {
                    txn.execute(
                        &format!("DELETE FROM {table} WHERE account = ? AND encryption = ?"),
                        (account.as_str(), encryption.as_str()),
                    )?;
                }
                Ok::<_, Error>(())
            })
            .await
    }

    /// Remove all trust data of the account, across all encryption schemes.
    pub async fn reset_account(&self) -> Result<()> {
        let account = self.account_jid.clone();

        self.acquire()
            .await?
            .with_transaction(move |txn| {
                for table in [
                    "trust_security_policies",
                    "trust_own_keys",
                    "trust_keys",
                    "trust_keys_unprocessed",
                ] {
                    txn.execute(
                        &format!("DELETE FROM {table} WHERE account = ?"),
                        (account.as_str(),),
                    )?;
                }
                Ok::<_, Error>(())
            })
            .await
    }
}

/// Insert or replace one trust key row.
fn insert_key(
    txn: &Transaction<'_>,
    account: &str,
    encryption: &str,
    owner_jid: &str,
    key_id: &[u8],
    trust_level: TrustLevel,
) -> rusqlite::Result<()> {
    txn.execute(
        "INSERT OR REPLACE INTO trust_keys (account, encryption, key_id, owner_jid, trust_level)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (account, encryption, key_id, owner_jid, trust_level as u8),
    )?;
    Ok(())
}

/// Read-modify-write of one key's trust level. Returns whether the effective
/// level transitioned.
fn upsert_trust_level(
    txn: &Transaction<'_>,
    account: &str,
    encryption: &str,
    owner_jid: &str,
    key_id: &[u8],
    trust_level: TrustLevel,
) -> rusqlite::Result<bool> {
    let existing = txn
        .query_row(
            "SELECT rowid, trust_level FROM trust_keys
             WHERE account = ? AND encryption = ? AND owner_jid = ? AND key_id = ?",
            (account, encryption, owner_jid, key_id),
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    match existing {
        Some((_, level)) if level == trust_level as u8 as i64 => Ok(false),
        Some((row_id, _)) => {
            txn.execute(
                "UPDATE trust_keys SET trust_level = ? WHERE rowid = ?",
                (trust_level as u8, row_id),
            )?;
            Ok(true)
        }
        None => {
            insert_key(txn, account, encryption, owner_jid, key_id, trust_level)?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use once_cell::sync::Lazy;
    use tempfile::{tempdir, TempDir};

    use super::SqliteTrustStore;
    use crate::types::{
        KeyId, SecurityPolicy, TrustEvent, TrustLevel, TrustLevels, TrustMessageKeyOwner,
    };

    static TMP_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().unwrap());

    const OMEMO: &str = "urn:xmpp:omemo:2";
    const OX: &str = "urn:xmpp:openpgp:0";

    async fn get_store(name: &str) -> SqliteTrustStore {
        let tmpdir_path = TMP_DIR.path().join(name);
        SqliteTrustStore::open(tmpdir_path, "alice@example.org").await.unwrap()
    }

    fn key(byte: u8) -> KeyId {
        vec![byte; 32]
    }

    #[tokio::test]
    async fn trust_level_defaults_to_undecided() {
        let store = get_store("trust_level_defaults_to_undecided").await;

        let level = store.trust_level(OMEMO, "bob@example.org", &key(1)).await.unwrap();
        assert_eq!(level, TrustLevel::Undecided);
    }

    #[tokio::test]
    async fn security_policy_and_own_key_round_trip() {
        let store = get_store("security_policy_and_own_key_round_trip").await;

        assert_eq!(store.security_policy(OMEMO).await.unwrap(), SecurityPolicy::NoSecurityPolicy);
        assert!(store.own_key(OMEMO).await.unwrap().is_empty());

        store.set_security_policy(OMEMO, SecurityPolicy::Toakafa).await.unwrap();
        store.set_own_key(OMEMO, key(9)).await.unwrap();

        assert_eq!(store.security_policy(OMEMO).await.unwrap(), SecurityPolicy::Toakafa);
        assert_eq!(store.own_key(OMEMO).await.unwrap(), key(9));

        // Setting again is idempotent.
        store.set_security_policy(OMEMO, SecurityPolicy::Toakafa).await.unwrap();
        assert_eq!(store.security_policy(OMEMO).await.unwrap(), SecurityPolicy::Toakafa);

        store.reset_security_policy(OMEMO).await.unwrap();
        store.reset_own_key(OMEMO).await.unwrap();

        assert_eq!(store.security_policy(OMEMO).await.unwrap(), SecurityPolicy::NoSecurityPolicy);
        assert!(store.own_key(OMEMO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_groups_by_level_and_owner() {
        let store = get_store("keys_groups_by_level_and_owner").await;

        store
            .add_keys(
                OMEMO,
                "a@example.org",
                vec![key(1), key(2)],
                TrustLevel::AutomaticallyDistrusted,
            )
            .await
            .unwrap();
        store
            .add_keys(OMEMO, "b@example.org", vec![key(3)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();

        let keys = store.keys(OMEMO, TrustLevels::empty()).await.unwrap();
        assert_eq!(keys.len(), 2);

        let distrusted = &keys[&TrustLevel::AutomaticallyDistrusted];
        let mut a_keys = distrusted["a@example.org"].clone();
        a_keys.sort();
        assert_eq!(a_keys, vec![key(1), key(2)]);

        let trusted = &keys[&TrustLevel::ManuallyTrusted];
        assert_eq!(trusted["b@example.org"], vec![key(3)]);

        // Filtering by mask only returns matching levels.
        let filtered = store.keys(OMEMO, TrustLevels::MANUALLY_TRUSTED).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key(&TrustLevel::ManuallyTrusted));
    }

    #[tokio::test]
    async fn undecided_only_mask_matches_no_keys() {
        let store = get_store("undecided_only_mask_matches_no_keys").await;

        store
            .add_keys(OMEMO, "a@example.org", vec![key(1)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();

        // Undecided is virtual, so a mask of only that level filters
        // everything out instead of degrading to "all levels".
        let keys = store.keys(OMEMO, TrustLevels::UNDECIDED).await.unwrap();
        assert!(keys.is_empty());

        let keys = store
            .keys_by_owner(OMEMO, vec!["a@example.org".to_owned()], TrustLevels::UNDECIDED)
            .await
            .unwrap();
        assert!(keys.is_empty());

        // Combined with a stored level, only that level matches.
        let keys = store
            .keys(OMEMO, TrustLevels::UNDECIDED | TrustLevels::MANUALLY_TRUSTED)
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains_key(&TrustLevel::ManuallyTrusted));
    }

    #[tokio::test]
    async fn keys_by_owner_omits_owners_without_keys() {
        let store = get_store("keys_by_owner_omits_owners_without_keys").await;

        store
            .add_keys(OMEMO, "a@example.org", vec![key(1)], TrustLevel::Authenticated)
            .await
            .unwrap();

        let keys = store
            .keys_by_owner(
                OMEMO,
                vec!["a@example.org".to_owned(), "b@example.org".to_owned()],
                TrustLevels::empty(),
            )
            .await
            .unwrap();

        assert_eq!(keys.len(), 1);
        assert_eq!(keys["a@example.org"][&key(1)], TrustLevel::Authenticated);
        assert!(!keys.contains_key("b@example.org"));
    }

    #[tokio::test]
    async fn remove_keys_by_owner_leaves_other_owners_and_schemes() {
        let store = get_store("remove_keys_by_owner_leaves_other_owners_and_schemes").await;

        store
            .add_keys(OMEMO, "a@example.org", vec![key(1)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();
        store
            .add_keys(OMEMO, "b@example.org", vec![key(2)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();
        store
            .add_keys(OX, "a@example.org", vec![key(3)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();

        store.remove_keys_by_owner(OMEMO, "a@example.org").await.unwrap();

        assert_eq!(
            store.trust_level(OMEMO, "a@example.org", &key(1)).await.unwrap(),
            TrustLevel::Undecided
        );
        assert_eq!(
            store.trust_level(OMEMO, "b@example.org", &key(2)).await.unwrap(),
            TrustLevel::ManuallyTrusted
        );
        assert_eq!(
            store.trust_level(OX, "a@example.org", &key(3)).await.unwrap(),
            TrustLevel::ManuallyTrusted
        );
    }

    #[tokio::test]
    async fn set_trust_level_inserts_missing_keys() {
        let store = get_store("set_trust_level_inserts_missing_keys").await;
        let mut updates = store.subscribe();

        let changes = store
            .set_trust_level(
                OMEMO,
                vec![("bob@example.org".to_owned(), key(1))],
                TrustLevel::Authenticated,
            )
            .await
            .unwrap();

        assert_eq!(changes[OMEMO]["bob@example.org"], vec![key(1)]);
        assert_eq!(
            store.trust_level(OMEMO, "bob@example.org", &key(1)).await.unwrap(),
            TrustLevel::Authenticated
        );

        let TrustEvent::KeysChanged { changes } = updates.try_recv().unwrap();
        assert_eq!(changes[OMEMO]["bob@example.org"], vec![key(1)]);

        // Setting the same level again changes nothing and emits nothing.
        let changes = store
            .set_trust_level(
                OMEMO,
                vec![("bob@example.org".to_owned(), key(1))],
                TrustLevel::Authenticated,
            )
            .await
            .unwrap();
        assert!(changes[OMEMO].is_empty());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn set_trust_level_transition_only_moves_old_level() {
        let store = get_store("set_trust_level_transition_only_moves_old_level").await;

        store
            .add_keys(OMEMO, "a@example.org", vec![key(1)], TrustLevel::Authenticated)
            .await
            .unwrap();
        store
            .add_keys(OMEMO, "a@example.org", vec![key(2)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();

        let changes = store
            .set_trust_level_transition(
                OMEMO,
                vec!["a@example.org".to_owned()],
                TrustLevel::Authenticated,
                TrustLevel::ManuallyDistrusted,
            )
            .await
            .unwrap();

        assert_eq!(changes[OMEMO]["a@example.org"], vec![key(1)]);
        assert_eq!(
            store.trust_level(OMEMO, "a@example.org", &key(1)).await.unwrap(),
            TrustLevel::ManuallyDistrusted
        );
        assert_eq!(
            store.trust_level(OMEMO, "a@example.org", &key(2)).await.unwrap(),
            TrustLevel::ManuallyTrusted
        );

        // No insertion branch: an unknown owner produces no changes.
        let changes = store
            .set_trust_level_transition(
                OMEMO,
                vec!["unknown@example.org".to_owned()],
                TrustLevel::Authenticated,
                TrustLevel::ManuallyDistrusted,
            )
            .await
            .unwrap();
        assert!(changes[OMEMO].is_empty());
    }

    #[tokio::test]
    async fn has_key_respects_mask() {
        let store = get_store("has_key_respects_mask").await;

        store
            .add_keys(OMEMO, "a@example.org", vec![key(1)], TrustLevel::AutomaticallyTrusted)
            .await
            .unwrap();

        assert!(store
            .has_key(OMEMO, "a@example.org", TrustLevels::AUTOMATICALLY_TRUSTED)
            .await
            .unwrap());
        assert!(!store
            .has_key(OMEMO, "a@example.org", TrustLevels::AUTHENTICATED)
            .await
            .unwrap());
        assert!(!store
            .has_key(OMEMO, "b@example.org", TrustLevels::AUTOMATICALLY_TRUSTED)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn postponed_conflicting_rows_are_independent() {
        let store = get_store("postponed_conflicting_rows_are_independent").await;

        // The same key listed as both trusted and distrusted yields two rows.
        store
            .add_keys_for_postponed_trust_decisions(
                OMEMO,
                &key(9),
                vec![TrustMessageKeyOwner {
                    jid: "bob@example.org".to_owned(),
                    trusted_keys: vec![key(1)],
                    distrusted_keys: vec![key(1)],
                }],
            )
            .await
            .unwrap();

        let decisions = store.keys_for_postponed_trust_decisions(OMEMO, vec![]).await.unwrap();
        assert_eq!(decisions.to_trust["bob@example.org"], vec![key(1)]);
        assert_eq!(decisions.to_distrust["bob@example.org"], vec![key(1)]);

        // Removing via the trusted selector leaves the distrust-flagged row.
        store
            .remove_keys_for_postponed_trust_decisions(OMEMO, vec![key(1)], vec![])
            .await
            .unwrap();

        let decisions = store.keys_for_postponed_trust_decisions(OMEMO, vec![]).await.unwrap();
        assert!(decisions.to_trust.is_empty());
        assert_eq!(decisions.to_distrust["bob@example.org"], vec![key(1)]);
    }

    #[tokio::test]
    async fn postponed_decisions_filter_by_sender() {
        let store = get_store("postponed_decisions_filter_by_sender").await;

        let owner = |trusted: KeyId| TrustMessageKeyOwner {
            jid: "bob@example.org".to_owned(),
            trusted_keys: vec![trusted],
            distrusted_keys: vec![],
        };
        store
            .add_keys_for_postponed_trust_decisions(OMEMO, &key(8), vec![owner(key(1))])
            .await
            .unwrap();
        store
            .add_keys_for_postponed_trust_decisions(OMEMO, &key(9), vec![owner(key(2))])
            .await
            .unwrap();

        let decisions =
            store.keys_for_postponed_trust_decisions(OMEMO, vec![key(8)]).await.unwrap();
        assert_eq!(decisions.to_trust["bob@example.org"], vec![key(1)]);

        let decisions = store.keys_for_postponed_trust_decisions(OMEMO, vec![]).await.unwrap();
        let mut all = decisions.to_trust["bob@example.org"].clone();
        all.sort();
        assert_eq!(all, vec![key(1), key(2)]);

        store
            .remove_postponed_trust_decisions_by_senders(OMEMO, vec![key(8)])
            .await
            .unwrap();
        let decisions = store.keys_for_postponed_trust_decisions(OMEMO, vec![]).await.unwrap();
        assert_eq!(decisions.to_trust["bob@example.org"], vec![key(2)]);
    }

    #[tokio::test]
    async fn apply_postponed_trust_decisions_applies_then_purges() {
        let store = get_store("apply_postponed_trust_decisions_applies_then_purges").await;

        store
            .add_keys_for_postponed_trust_decisions(
                OMEMO,
                &key(9),
                vec![TrustMessageKeyOwner {
                    jid: "bob@example.org".to_owned(),
                    trusted_keys: vec![key(1)],
                    distrusted_keys: vec![key(2)],
                }],
            )
            .await
            .unwrap();

        let changes = store.apply_postponed_trust_decisions(OMEMO, vec![key(9)]).await.unwrap();
        let mut changed = changes[OMEMO]["bob@example.org"].clone();
        changed.sort();
        assert_eq!(changed, vec![key(1), key(2)]);

        assert_eq!(
            store.trust_level(OMEMO, "bob@example.org", &key(1)).await.unwrap(),
            TrustLevel::Authenticated
        );
        assert_eq!(
            store.trust_level(OMEMO, "bob@example.org", &key(2)).await.unwrap(),
            TrustLevel::ManuallyDistrusted
        );

        // The ledger was purged, so a second resolution applies nothing.
        assert!(store
            .keys_for_postponed_trust_decisions(OMEMO, vec![key(9)])
            .await
            .unwrap()
            .is_empty());
        let changes = store.apply_postponed_trust_decisions(OMEMO, vec![key(9)]).await.unwrap();
        assert!(changes[OMEMO].is_empty());
    }

    #[tokio::test]
    async fn reset_all_only_clears_one_scheme() {
        let store = get_store("reset_all_only_clears_one_scheme").await;

        for encryption in [OMEMO, OX] {
            store.set_security_policy(encryption, SecurityPolicy::Toakafa).await.unwrap();
            store.set_own_key(encryption, key(9)).await.unwrap();
            store
                .add_keys(encryption, "a@example.org", vec![key(1)], TrustLevel::ManuallyTrusted)
                .await
                .unwrap();
            store
                .add_keys_for_postponed_trust_decisions(
                    encryption,
                    &key(8),
                    vec![TrustMessageKeyOwner {
                        jid: "b@example.org".to_owned(),
                        trusted_keys: vec![key(2)],
                        distrusted_keys: vec![],
                    }],
                )
                .await
                .unwrap();
        }

        store.reset_all(OMEMO).await.unwrap();

        assert_eq!(store.security_policy(OMEMO).await.unwrap(), SecurityPolicy::NoSecurityPolicy);
        assert!(store.own_key(OMEMO).await.unwrap().is_empty());
        assert!(store.keys(OMEMO, TrustLevels::empty()).await.unwrap().is_empty());
        assert!(store
            .keys_for_postponed_trust_decisions(OMEMO, vec![])
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.security_policy(OX).await.unwrap(), SecurityPolicy::Toakafa);
        assert_eq!(store.own_key(OX).await.unwrap(), key(9));
        assert_eq!(store.keys(OX, TrustLevels::empty()).await.unwrap().len(), 1);
        assert!(!store
            .keys_for_postponed_trust_decisions(OX, vec![])
            .await
            .unwrap()
            .is_empty());

        store.reset_account().await.unwrap();
        assert!(store.keys(OX, TrustLevels::empty()).await.unwrap().is_empty());
        assert_eq!(store.security_policy(OX).await.unwrap(), SecurityPolicy::NoSecurityPolicy);
    }

    #[tokio::test]
    async fn add_keys_round_trip_reproduces_fixture() {
        let store = get_store("add_keys_round_trip_reproduces_fixture").await;

        store
            .add_keys(
                OMEMO,
                "a@example.org",
                vec![key(1), key(2)],
                TrustLevel::AutomaticallyDistrusted,
            )
            .await
            .unwrap();
        store
            .add_keys(OMEMO, "b@example.org", vec![key(3)], TrustLevel::ManuallyTrusted)
            .await
            .unwrap();

        let keys = store.keys(OMEMO, TrustLevels::empty()).await.unwrap();

        let mut expected_a: HashMap<String, Vec<KeyId>> = HashMap::new();
        expected_a.insert("a@example.org".to_owned(), vec![key(1), key(2)]);
        let mut actual_a = keys[&TrustLevel::AutomaticallyDistrusted].clone();
        actual_a.get_mut("a@example.org").unwrap().sort();
        assert_eq!(actual_a, expected_a);

        let mut expected_b: HashMap<String, Vec<KeyId>> = HashMap::new();
        expected_b.insert("b@example.org".to_owned(), vec![key(3)]);
        assert_eq!(keys[&TrustLevel::ManuallyTrusted], expected_b);
    }
}
