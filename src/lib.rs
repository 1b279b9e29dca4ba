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

//! An SQLite-backed trust management and group chat membership layer for XMPP
//! clients.
//!
//! The crate persists three closely related kinds of state for one account:
//!
//! * the trust levels of end-to-end encryption keys, per encryption scheme
//!   ([`SqliteTrustStore`]),
//! * trust assertions that cannot be applied yet because their sender key is
//!   itself unresolved (the postponed ledger, also part of
//!   [`SqliteTrustStore`]),
//! * the users of group chats and their lifecycle status
//!   ([`SqliteGroupChatStore`]).
//!
//! The [`Reconciler`] routes incoming protocol events to the right store
//! operations. All stores of one account share a single-connection pool, so
//! mutations are totally ordered; changes are broadcast via [`tokio`]
//! channels.

#![warn(missing_debug_implementations)]

mod error;
mod group_chat_store;
mod reconciler;
mod trust_store;
mod types;
mod utils;

pub use deadpool_sqlite::Pool as SqlitePool;

pub use self::{
    error::{Error, OpenStoreError, Result},
    group_chat_store::{MessageLookup, SqliteGroupChatStore, QUERY_LIMIT_GROUP_CHAT_USERS},
    reconciler::Reconciler,
    trust_store::SqliteTrustStore,
    types::{
        GroupChatUser, GroupChatUserEvent, GroupChatUserStatus, KeyId, OwnerKeyIds,
        PostponedTrustDecisions, SecurityPolicy, TrustChanges, TrustEvent, TrustLevel,
        TrustLevels, TrustMessageKeyOwner,
    },
};
