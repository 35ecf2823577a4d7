use std::{borrow::Cow, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseTransaction, DbConn, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, SqlErr, TransactionTrait,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{instrument, warn};
use url::{Host, Url};

use crate::{config::db_conn_capsule, orm::short_url};

pub fn url_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(UrlRepositoryImpl { db })
}

/// A short code that is known to match the configured length and the URL-safe alphabet.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortCodeValidationError {
    #[error("short code must be {expected} characters long, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("short code contains characters outside [A-Za-z0-9_-]: {invalid_chars:?}")]
    InvalidCharacters { invalid_chars: String },
}

impl ShortCode {
    /// # Errors
    /// Will return [`Err`] if `code` is not exactly `length` characters of `[A-Za-z0-9_-]`.
    pub fn new(code: String, length: usize) -> Result<Self, ShortCodeValidationError> {
        let invalid_chars: String = code.chars().filter(|c| !is_url_safe_char(*c)).collect();
        if !invalid_chars.is_empty() {
            return Err(ShortCodeValidationError::InvalidCharacters { invalid_chars });
        }

        // NOTE: all remaining chars are ASCII, so byte length == char count
        if code.len() != length {
            return Err(ShortCodeValidationError::WrongLength {
                expected: length,
                actual: code.len(),
            });
        }

        Ok(Self(code))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

const fn is_url_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// A long URL that passed validation; keeps the caller's exact spelling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalUrl(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidUrlError {
    #[error("URL is required")]
    Empty,
    #[error("URL is malformed: {0}")]
    Malformed(#[from] url::ParseError),
    #[error("URL scheme {0:?} is not supported")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    #[error("URL host {0:?} has no top-level domain")]
    MissingTopLevelDomain(String),
}

impl OriginalUrl {
    const ALLOWED_SCHEMES: [&'static str; 3] = ["http", "https", "ftp"];
    const IMPLIED_SCHEME: &'static str = "http://";

    /// Accepts `scheme://host[/...]` for http(s)/ftp, or a bare `host.tld[/...]`
    /// which is read as http.
    ///
    /// # Errors
    /// Will return [`Err`] if `url` is blank, does not parse, uses another scheme,
    /// or names a host that is neither an IP address nor a domain with a top-level domain.
    pub fn new(url: String) -> Result<Self, InvalidUrlError> {
        if url.trim().is_empty() {
            return Err(InvalidUrlError::Empty);
        }

        let parsed = Url::parse(&Self::absolute(&url))?;
        if !Self::ALLOWED_SCHEMES.contains(&parsed.scheme()) {
            return Err(InvalidUrlError::UnsupportedScheme(parsed.scheme().to_owned()));
        }
        match parsed.host() {
            None => return Err(InvalidUrlError::MissingHost),
            Some(Host::Domain(domain)) if !has_top_level_domain(domain) => {
                return Err(InvalidUrlError::MissingTopLevelDomain(domain.to_owned()));
            }
            Some(_) => {}
        }

        Ok(Self(url))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `url` with `http://` prepended when it was stored without a scheme.
    #[must_use]
    pub fn absolute(url: &str) -> Cow<'_, str> {
        match Url::parse(url) {
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Cow::Owned(format!("{}{url}", Self::IMPLIED_SCHEME))
            }
            _ => Cow::Borrowed(url),
        }
    }
}

/// `example.com` and `xn--bcher-kva.de` qualify; `localhost` and `example.c0m` do not.
fn has_top_level_domain(domain: &str) -> bool {
    domain
        .trim_end_matches('.')
        .rsplit_once('.')
        .is_some_and(|(name, tld)| {
            !name.is_empty()
                && (tld.starts_with("xn--")
                    || (tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())))
        })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlMapping {
    pub short_code: String,
    pub original_url: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum InsertMappingError {
    #[error("short code is already taken")]
    ShortCodeTaken,
    #[error("internal/database error: {0}")]
    Internal(anyhow::Error),
}

#[async_trait]
pub trait UrlRepository: Send + Sync {
    /// Opens a unit of work; dropping it without [`UrlTransaction::commit`] rolls it back.
    async fn begin(&self) -> anyhow::Result<Box<dyn UrlTransaction>>;

    /// Deletes every mapping created before `created_before`, returning how many were removed.
    async fn delete_expired_urls(&self, created_before: OffsetDateTime) -> anyhow::Result<u64>;
}

#[async_trait]
pub trait UrlTransaction: Send {
    /// All mappings for `original_url`, newest first.
    async fn find_by_original_url(&mut self, original_url: &str)
    -> anyhow::Result<Vec<UrlMapping>>;

    /// Fetches the mapping for `short_code` and holds its row lock until the transaction ends.
    async fn find_by_short_code_for_update(
        &mut self,
        short_code: &str,
    ) -> anyhow::Result<Option<UrlMapping>>;

    async fn short_code_exists(&mut self, short_code: &str) -> anyhow::Result<bool>;

    /// Inserts `mapping`, reporting a unique-constraint violation as
    /// [`InsertMappingError::ShortCodeTaken`] while leaving the transaction usable.
    async fn insert_mapping(&mut self, mapping: UrlMapping) -> Result<(), InsertMappingError>;

    /// Returns whether a row was actually deleted.
    async fn delete_mapping(&mut self, short_code: &str) -> anyhow::Result<bool>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

struct UrlRepositoryImpl {
    db: DbConn,
}

#[async_trait]
impl UrlRepository for UrlRepositoryImpl {
    #[instrument(skip(self))]
    async fn begin(&self) -> anyhow::Result<Box<dyn UrlTransaction>> {
        let txn = self
            .db
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Box::new(UrlTransactionImpl { txn }))
    }

    #[instrument(skip(self))]
    async fn delete_expired_urls(&self, created_before: OffsetDateTime) -> anyhow::Result<u64> {
        let result = short_url::Entity::delete_many()
            .filter(short_url::Column::CreatedAt.lt(created_before))
            .exec(&self.db)
            .await
            .context("Failed to delete expired URLs")?;
        Ok(result.rows_affected)
    }
}

struct UrlTransactionImpl {
    txn: DatabaseTransaction,
}

#[async_trait]
impl UrlTransaction for UrlTransactionImpl {
    #[instrument(skip(self))]
    async fn find_by_original_url(
        &mut self,
        original_url: &str,
    ) -> anyhow::Result<Vec<UrlMapping>> {
        let rows = short_url::Entity::find()
            .filter(short_url::Column::OriginalUrl.eq(original_url))
            .order_by_desc(short_url::Column::CreatedAt)
            .all(&self.txn)
            .await
            .context("Failed to look up mappings by original URL")?;
        Ok(rows.into_iter().map(UrlMapping::from).collect())
    }

    #[instrument(skip(self))]
    async fn find_by_short_code_for_update(
        &mut self,
        short_code: &str,
    ) -> anyhow::Result<Option<UrlMapping>> {
        let row = short_url::Entity::find_by_id(short_code)
            .lock_exclusive()
            .one(&self.txn)
            .await
            .context("Failed to lock mapping by short code")?;
        Ok(row.map(UrlMapping::from))
    }

    #[instrument(skip(self))]
    async fn short_code_exists(&mut self, short_code: &str) -> anyhow::Result<bool> {
        let row = short_url::Entity::find_by_id(short_code)
            .one(&self.txn)
            .await
            .context("Failed to check short code existence")?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn insert_mapping(&mut self, mapping: UrlMapping) -> Result<(), InsertMappingError> {
        // NOTE: a failed statement aborts a Postgres transaction,
        // so the insert runs inside a savepoint that can be discarded on conflict
        let savepoint = self
            .txn
            .begin()
            .await
            .context("Failed to open savepoint")
            .map_err(InsertMappingError::Internal)?;

        let to_insert = short_url::ActiveModel {
            short_code: Set(mapping.short_code),
            original_url: Set(mapping.original_url),
            created_at: Set(mapping.created_at),
        };

        match short_url::Entity::insert(to_insert)
            .exec_without_returning(&savepoint)
            .await
        {
            Ok(_) => savepoint
                .commit()
                .await
                .context("Failed to release savepoint")
                .map_err(InsertMappingError::Internal),
            Err(db_err) => {
                let is_conflict = is_unique_violation(db_err.sql_err());
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(?rollback_err, "Failed to roll back savepoint");
                }
                if is_conflict {
                    Err(InsertMappingError::ShortCodeTaken)
                } else {
                    Err(InsertMappingError::Internal(
                        anyhow::Error::new(db_err).context("Failed to insert mapping"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_mapping(&mut self, short_code: &str) -> anyhow::Result<bool> {
        let result = short_url::Entity::delete_by_id(short_code)
            .exec(&self.txn)
            .await
            .context("Failed to delete mapping")?;
        Ok(result.rows_affected > 0)
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.txn
            .commit()
            .await
            .context("Failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.txn
            .rollback()
            .await
            .context("Failed to roll back transaction")
    }
}

fn is_unique_violation(sql_err: Option<SqlErr>) -> bool {
    matches!(sql_err, Some(SqlErr::UniqueConstraintViolation(_)))
}

impl From<short_url::Model> for UrlMapping {
    fn from(
        short_url::Model {
            short_code,
            original_url,
            created_at,
        }: short_url::Model,
    ) -> Self {
        Self {
            short_code,
            original_url,
            created_at,
        }
    }
}
