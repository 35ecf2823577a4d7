use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::{
    code_gen::{
        AllocateError, AllocationBudget, AllocationError, CodeGenerator, allocate_unique_code,
    },
    config::{EngineSettings, clock_capsule, code_generator_capsule, engine_settings_capsule},
    expiry::Clock,
    url_repo::{
        InsertMappingError, InvalidUrlError, OriginalUrl, ShortCode, ShortCodeValidationError,
        UrlMapping, UrlRepository, UrlTransaction, url_repository_capsule,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShortenedUrl {
    pub short_code: String,
    pub original_url: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub original_url: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UrlCreationStatus {
    NewlyCreated,
    AlreadyExists,
}

pub fn url_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UrlService> {
    let url_repo = Arc::clone(get.as_ref(url_repository_capsule));
    let generator = Arc::clone(get.as_ref(code_generator_capsule));
    let clock = Arc::clone(get.as_ref(clock_capsule));
    let settings = *get.as_ref(engine_settings_capsule);
    Arc::new(UrlServiceImpl {
        url_repo,
        generator,
        clock,
        settings,
    })
}

#[async_trait]
pub trait UrlService: Send + Sync {
    /// Returns the live mapping for `original_url`, creating one if there is none.
    async fn shorten(
        &self,
        original_url: &str,
    ) -> Result<(ShortenedUrl, UrlCreationStatus), ShortenError>;

    /// Looks up `short_code`, purging it when it turns out to be expired.
    async fn resolve(&self, short_code: &str) -> Result<ResolvedUrl, ResolveError>;

    /// Deletes every expired mapping at once, returning how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

#[derive(Debug, Error)]
pub enum ShortenError {
    #[error("invalid URL: {0}")]
    InvalidInput(#[from] InvalidUrlError),
    #[error("no free short code found after {attempts} attempts")]
    CapacityExhausted { attempts: u32 },
    #[error("internal/database error: {0}")]
    StorageFailure(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid short code: {0}")]
    InvalidInput(#[from] ShortCodeValidationError),
    #[error("URL not found or expired")]
    NotFound,
    #[error("internal/database error: {0}")]
    StorageFailure(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

impl From<AllocateError> for ShortenError {
    fn from(err: AllocateError) -> Self {
        match err {
            AllocateError::Exhausted(AllocationError::Exhausted { attempts }) => {
                Self::CapacityExhausted { attempts }
            }
            AllocateError::Storage(err) => Self::StorageFailure(err),
        }
    }
}

struct UrlServiceImpl {
    url_repo: Arc<dyn UrlRepository>,
    generator: Arc<dyn CodeGenerator>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

#[async_trait]
impl UrlService for UrlServiceImpl {
    #[instrument(skip(self))]
    async fn shorten(
        &self,
        original_url: &str,
    ) -> Result<(ShortenedUrl, UrlCreationStatus), ShortenError> {
        let original_url = OriginalUrl::new(original_url.to_owned())?;

        let mut txn = self
            .url_repo
            .begin()
            .await
            .map_err(ShortenError::StorageFailure)?;
        let outcome = self.shorten_in(&mut *txn, &original_url).await;
        finish(txn, outcome, ShortenError::StorageFailure).await
    }

    #[instrument(skip(self))]
    async fn resolve(&self, short_code: &str) -> Result<ResolvedUrl, ResolveError> {
        let short_code = ShortCode::new(short_code.to_owned(), self.settings.code_length)?;

        let mut txn = self
            .url_repo
            .begin()
            .await
            .map_err(ResolveError::StorageFailure)?;
        let outcome = self
            .resolve_in(&mut *txn, &short_code)
            .await
            .map_err(ResolveError::StorageFailure);
        finish(txn, outcome, ResolveError::StorageFailure)
            .await?
            .ok_or(ResolveError::NotFound)
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> anyhow::Result<u64> {
        let cutoff = self.settings.expiry.cutoff(self.clock.now());
        let deleted = self.url_repo.delete_expired_urls(cutoff).await?;
        info!(deleted, %cutoff, "Purged expired mappings");
        Ok(deleted)
    }
}

impl UrlServiceImpl {
    async fn shorten_in(
        &self,
        txn: &mut dyn UrlTransaction,
        original_url: &OriginalUrl,
    ) -> Result<(ShortenedUrl, UrlCreationStatus), ShortenError> {
        let now = self.clock.now();

        let mut live = None;
        for mapping in txn
            .find_by_original_url(original_url.as_str())
            .await
            .map_err(ShortenError::StorageFailure)?
        {
            if self.settings.expiry.is_expired(mapping.created_at, now) {
                info!(short_code = ?mapping.short_code, "Purging expired mapping");
                txn.delete_mapping(&mapping.short_code)
                    .await
                    .map_err(ShortenError::StorageFailure)?;
            } else if live.is_none() {
                // NOTE: rows come newest first, so the first live one wins
                live = Some(mapping);
            }
        }

        if let Some(mapping) = live {
            return Ok((self.shortened(mapping), UrlCreationStatus::AlreadyExists));
        }

        let mut budget = AllocationBudget::new(self.settings.max_allocation_attempts);
        loop {
            let short_code = allocate_unique_code(
                txn,
                self.generator.as_ref(),
                self.settings.code_length,
                &mut budget,
            )
            .await?;

            let mapping = UrlMapping {
                short_code: short_code.into_inner(),
                original_url: original_url.as_str().to_owned(),
                created_at: now,
            };
            match txn.insert_mapping(mapping.clone()).await {
                Ok(()) => return Ok((self.shortened(mapping), UrlCreationStatus::NewlyCreated)),
                Err(InsertMappingError::ShortCodeTaken) => {
                    warn!(
                        short_code = ?mapping.short_code,
                        attempts = budget.used(),
                        "Lost insert race for short code; retrying with a fresh one"
                    );
                }
                Err(InsertMappingError::Internal(err)) => {
                    return Err(ShortenError::StorageFailure(err));
                }
            }
        }
    }

    async fn resolve_in(
        &self,
        txn: &mut dyn UrlTransaction,
        short_code: &ShortCode,
    ) -> anyhow::Result<Option<ResolvedUrl>> {
        let Some(mapping) = txn.find_by_short_code_for_update(short_code.as_str()).await? else {
            return Ok(None);
        };

        if self
            .settings
            .expiry
            .is_expired(mapping.created_at, self.clock.now())
        {
            info!(short_code = ?mapping.short_code, "Purging expired mapping");
            txn.delete_mapping(&mapping.short_code).await?;
            return Ok(None);
        }

        Ok(Some(ResolvedUrl {
            expires_at: self.settings.expiry.expires_at(mapping.created_at),
            original_url: mapping.original_url,
        }))
    }

    fn shortened(&self, mapping: UrlMapping) -> ShortenedUrl {
        ShortenedUrl {
            expires_at: self.settings.expiry.expires_at(mapping.created_at),
            short_code: mapping.short_code,
            original_url: mapping.original_url,
        }
    }
}

/// Commits on success and rolls back on failure, so no error leaves a transaction open.
async fn finish<T, E>(
    txn: Box<dyn UrlTransaction>,
    outcome: Result<T, E>,
    storage_failure: fn(anyhow::Error) -> E,
) -> Result<T, E> {
    match outcome {
        Ok(value) => {
            txn.commit().await.map_err(storage_failure)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                error!(?rollback_err, "Failed to roll back transaction");
            }
            Err(err)
        }
    }
}
