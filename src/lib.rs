//! # kyro-identity - Identity resolution over partial contact facts
//!
//! kyro-identity turns a stream of partial identity facts (an email, a phone
//! number, or both) into stable identities. Contacts that share an attribute
//! are linked into one chain with a single primary anchor; every call returns
//! the consolidated view of everything known about that identity.
//!
//! ## Core Concepts
//!
//! - **Contact**: A stored fact, either a chain's primary or a secondary linked to it
//! - **Chain**: A primary plus every active secondary whose `linked_id` names it
//! - **Resolver**: Classifies the contacts matching a request and creates, links, or merges
//! - **IntegrityGuard**: Out-of-band healer for orphans, cycles, and nested links
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use kyro_identity::{IdentifyRequest, InMemoryContactStore, Resolver};
//!
//! let store = Arc::new(InMemoryContactStore::new());
//! let resolver = Resolver::new(store);
//!
//! let first = resolver.identify(&IdentifyRequest::pair("doc@hillvalley.edu", "123456"))?;
//! let second = resolver.identify(&IdentifyRequest::pair("emmett@hillvalley.edu", "123456"))?;
//!
//! assert_eq!(first.contact.primary_contact_id, second.contact.primary_contact_id);
//! assert_eq!(second.contact.emails, vec!["doc@hillvalley.edu", "emmett@hillvalley.edu"]);
//! # Ok::<(), kyro_identity::IdentityError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod chain;
pub mod config;
pub mod contact;
pub mod error;
pub mod integrity;
pub mod locks;
pub mod matcher;
pub mod resolver;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use chain::{Chain, ChainManager, ConsolidatedContact, MergeReport, MergeStep, MergeStepFailure};
pub use config::{IdentityConfig, IntegrityConfig, RepairWorkerConfig, ResolverConfig};
pub use contact::{Contact, ContactId, LinkPrecedence, LinkageUpdate, NewContact};
pub use error::{FailureKind, IdentifyFailure, IdentityError, IdentityResult};
pub use integrity::{
    IntegrityGuard, RepairAction, RepairFailure, RepairHandle, RepairKind, RepairReport,
    RepairWorker,
};
pub use locks::AttributeLocks;
pub use matcher::ChainViolation;
pub use resolver::{
    needs_secondary, Branch, IdentifyRequest, IdentifyResponse, ResolutionPlan, Resolver,
    ScoredCandidate,
};
pub use storage::{ContactStore, InMemoryContactStore, StorageError};
