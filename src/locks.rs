//! Striped per-attribute locks in front of the resolver.
//!
//! Two `identify` calls that share an email or a phone number hash to a common
//! stripe and run one after the other, so concurrent identical requests cannot
//! both observe "no candidates" and create two primaries. Stripes are always
//! locked in ascending index order.

use std::sync::{Mutex, MutexGuard};

use crate::error::{IdentityError, IdentityResult};

/// A fixed set of mutex stripes keyed by attribute value.
#[derive(Debug)]
pub struct AttributeLocks {
    stripes: Vec<Mutex<()>>,
}

/// Holds every stripe for one request until dropped.
#[derive(Debug)]
pub struct AttributeGuard<'a> {
    stripes: Vec<usize>,
    _guards: Vec<MutexGuard<'a, ()>>,
}

impl AttributeGuard<'_> {
    /// Stripe indexes held, ascending.
    #[must_use]
    pub fn stripes(&self) -> &[usize] {
        &self.stripes
    }
}

impl AttributeLocks {
    /// Creates `stripes` locks (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of stripes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Always false; there is at least one stripe.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    /// Stripe index for an attribute `kind` ("email" or "phone") and value.
    #[must_use]
    pub fn stripe_for(&self, kind: &str, value: &str) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(&[0]);
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let bucket = u64::from_le_bytes(prefix) % self.stripes.len() as u64;
        #[allow(clippy::cast_possible_truncation)]
        let bucket = bucket as usize;
        bucket
    }

    /// Locks the stripes covering the given attributes.
    ///
    /// # Errors
    /// Returns `Internal` if a stripe was poisoned by a panicking holder.
    pub fn acquire(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> IdentityResult<AttributeGuard<'_>> {
        let mut stripes: Vec<usize> = email
            .map(|e| self.stripe_for("email", e))
            .into_iter()
            .chain(phone_number.map(|p| self.stripe_for("phone", p)))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();

        let mut guards = Vec::with_capacity(stripes.len());
        for &idx in &stripes {
            let guard = self.stripes[idx]
                .lock()
                .map_err(|_| IdentityError::internal(format!("attribute lock stripe {idx} poisoned")))?;
            guards.push(guard);
        }
        Ok(AttributeGuard {
            stripes,
            _guards: guards,
        })
    }
}
