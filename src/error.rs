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

use deadpool_sqlite::{CreatePoolError, PoolError};
use thiserror::Error;
use tokio::io;

/// All the errors that can occur when opening a store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum OpenStoreError {
    /// Failed to create the DB's parent directory.
    #[error("Failed to create the database's parent directory")]
    CreateDir(#[source] io::Error),

    /// Failed to create the DB pool.
    #[error(transparent)]
    CreatePool(#[from] CreatePoolError),

    /// Failed to apply migrations.
    #[error("Failed to run migrations")]
    Migration(#[source] rusqlite::Error),

    /// Failed to get a DB connection from the pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Failed to load the version of the database.
    #[error("Failed to load the database version")]
    LoadVersion(#[source] rusqlite::Error),

    /// The version loaded from the database is not a single byte.
    #[error("The database version is invalid")]
    InvalidVersion,

    /// The database has a kv table but no version entry.
    #[error("The database version is missing")]
    MissingVersion,
}

/// All the errors that can occur while a store operation runs.
///
/// Storage failures are unrecoverable at this layer; callers are expected to
/// treat them as fatal for the affected account session.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
