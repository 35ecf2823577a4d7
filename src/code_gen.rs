use std::iter;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::url_repo::{ShortCode, UrlTransaction};

/// Produces candidate short codes. Candidates are not checked against storage here.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// Draws `length` bytes from the thread-local CSPRNG and base64url-encodes them,
/// keeping the first `length` characters.
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let bytes: Vec<u8> = iter::repeat_with(rand::random::<u8>)
            .take(length)
            .collect();
        let mut encoded = URL_SAFE_NO_PAD.encode(bytes);
        encoded.truncate(length);
        encoded
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("no free short code found after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Running count of candidates tried for one shortening, shared across
/// pre-check misses and lost insert races.
#[derive(Debug)]
pub struct AllocationBudget {
    used: u32,
    max: u32,
}

impl AllocationBudget {
    #[must_use]
    pub const fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    #[must_use]
    pub const fn used(&self) -> u32 {
        self.used
    }

    fn take(&mut self) -> Result<(), AllocationError> {
        if self.used >= self.max {
            return Err(AllocationError::Exhausted {
                attempts: self.used,
            });
        }
        self.used += 1;
        Ok(())
    }
}

/// Generates candidates until one is absent from storage at the instant of the check.
///
/// The check is only an optimization; the caller must still treat a
/// unique-constraint violation on insert as authoritative and call again.
///
/// # Errors
/// Returns [`AllocateError::Exhausted`] once `budget` runs out, or
/// [`AllocateError::Storage`] if the existence check fails.
#[instrument(skip(txn, generator))]
pub async fn allocate_unique_code(
    txn: &mut dyn UrlTransaction,
    generator: &dyn CodeGenerator,
    length: usize,
    budget: &mut AllocationBudget,
) -> Result<ShortCode, AllocateError> {
    loop {
        budget.take()?;
        let candidate = generator.generate(length);
        let short_code = match ShortCode::new(candidate.clone(), length) {
            Ok(short_code) => short_code,
            Err(err) => {
                // NOTE: only reachable through a misbehaving generator
                warn!(?candidate, ?err, "Generated invalid short code");
                continue;
            }
        };

        if txn
            .short_code_exists(short_code.as_str())
            .await
            .map_err(AllocateError::Storage)?
        {
            warn!(?candidate, "Generated short code that was already taken");
            continue;
        }

        return Ok(short_code);
    }
}

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error(transparent)]
    Exhausted(#[from] AllocationError),
    #[error("internal/database error: {0}")]
    Storage(anyhow::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use crate::memory_repo::MemoryUrlRepository;
    use crate::url_repo::{UrlMapping, UrlRepository};

    use super::*;

    struct FixedGenerator(&'static str);

    impl CodeGenerator for FixedGenerator {
        fn generate(&self, _length: usize) -> String {
            self.0.to_owned()
        }
    }

    #[test]
    fn test_random_code_has_requested_length_and_alphabet() {
        let generator = RandomCodeGenerator;
        for length in [1, 2, 6, 11, 32] {
            let code = generator.generate(length);
            assert_eq!(code.len(), length);
            assert!(ShortCode::new(code, length).is_ok());
        }
    }

    #[test]
    fn test_random_codes_do_not_repeat() {
        let generator = RandomCodeGenerator;
        let codes: HashSet<_> = (0..1000).map(|_| generator.generate(6)).collect();
        // NOTE: 1000 draws from 64^6 codes; a collision here means the source is not random
        assert_eq!(codes.len(), 1000);
    }

    #[test]
    fn test_budget_counts_attempts() {
        let mut budget = AllocationBudget::new(2);
        assert!(budget.take().is_ok());
        assert!(budget.take().is_ok());
        assert_eq!(
            budget.take().unwrap_err(),
            AllocationError::Exhausted { attempts: 2 }
        );
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn test_allocate_returns_free_code() {
        let repo = MemoryUrlRepository::new();
        let mut txn = repo.begin().await.unwrap();
        let mut budget = AllocationBudget::new(3);

        let code = allocate_unique_code(&mut *txn, &RandomCodeGenerator, 6, &mut budget)
            .await
            .unwrap();

        assert_eq!(code.as_str().len(), 6);
        assert_eq!(budget.used(), 1);
    }

    #[tokio::test]
    async fn test_allocate_gives_up_when_every_candidate_is_taken() {
        let repo = MemoryUrlRepository::new();
        repo.insert_committed(UrlMapping {
            short_code: "AAAAAA".to_owned(),
            original_url: "https://example.com".to_owned(),
            created_at: time::OffsetDateTime::now_utc(),
        });

        let mut txn = repo.begin().await.unwrap();
        let mut budget = AllocationBudget::new(4);
        let err = allocate_unique_code(&mut *txn, &FixedGenerator("AAAAAA"), 6, &mut budget)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AllocateError::Exhausted(AllocationError::Exhausted { attempts: 4 })
        ));
    }

    #[tokio::test]
    async fn test_allocate_skips_malformed_candidates() {
        let repo = MemoryUrlRepository::new();
        let mut txn = repo.begin().await.unwrap();
        let mut budget = AllocationBudget::new(2);

        let err = allocate_unique_code(&mut *txn, &FixedGenerator("a+b"), 6, &mut budget)
            .await
            .unwrap_err();

        assert!(matches!(err, AllocateError::Exhausted(_)));
    }
}
