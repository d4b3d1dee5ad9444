//! Configuration for the resolver, the integrity guard, and the repair worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};

/// Resolver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Number of attribute lock stripes serializing overlapping requests.
    pub lock_stripes: usize,
    /// Re-check the resolved chain and log leftover violations.
    pub validate_after_resolve: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            lock_stripes: 64,
            validate_after_resolve: true,
        }
    }
}

/// Integrity guard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Upper bound on hops when walking a `linked_id` path.
    ///
    /// A walk that reaches the bound is broken at its last node as if it were a cycle.
    pub max_walk_hops: usize,
    /// Soft-delete contacts that carry neither an email nor a phone number.
    pub purge_empty_contacts: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            max_walk_hops: 1024,
            purge_empty_contacts: true,
        }
    }
}

/// Background repair worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairWorkerConfig {
    /// Maximum queued on-demand runs.
    pub queue_capacity: usize,
    /// Periodic run interval; `None` runs only on demand.
    #[serde(with = "optional_millis")]
    pub interval: Option<Duration>,
}

impl Default for RepairWorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            interval: None,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Resolver settings.
    pub resolver: ResolverConfig,
    /// Integrity guard settings.
    pub integrity: IntegrityConfig,
    /// Repair worker settings.
    pub repair_worker: RepairWorkerConfig,
}

impl IdentityConfig {
    /// Parses a JSON document; missing sections and fields take their defaults.
    ///
    /// # Errors
    /// Returns `InvalidRequest` for malformed JSON or out-of-range values.
    ///
    /// # Examples
    ///
    /// ```
    /// use kyro_identity::IdentityConfig;
    ///
    /// let cfg = IdentityConfig::from_json_str(r#"{"resolver": {"lock_stripes": 8}}"#).unwrap();
    /// assert_eq!(cfg.resolver.lock_stripes, 8);
    /// assert!(cfg.integrity.purge_empty_contacts);
    /// ```
    pub fn from_json_str(raw: &str) -> IdentityResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| IdentityError::invalid_request(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns `InvalidRequest` naming the offending field.
    pub fn validate(&self) -> IdentityResult<()> {
        if self.resolver.lock_stripes == 0 {
            return Err(IdentityError::invalid_request("resolver.lock_stripes must be > 0"));
        }
        if self.integrity.max_walk_hops == 0 {
            return Err(IdentityError::invalid_request("integrity.max_walk_hops must be > 0"));
        }
        if self.repair_worker.queue_capacity == 0 {
            return Err(IdentityError::invalid_request(
                "repair_worker.queue_capacity must be > 0",
            ));
        }
        Ok(())
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
