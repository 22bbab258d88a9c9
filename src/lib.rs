//! MailHub - scheduled multi-account mail sync with an encrypted store
//!
//! One command, run on a schedule, fetches new mail and calendar items for
//! every bound account, stores them in a single SQLCipher database, triages
//! what arrived and moves replies through a confirmed send queue.
//!
//! # Architecture
//!
//! - **vault**: Key backend selection (OS keyring, injected credential, sealed local file)
//! - **store**: The encrypted store and everything persisted in it
//! - **accounts**: Bound accounts, capability flags, secret references
//! - **provider**: Capability interface every provider implements, plus the file spool provider
//! - **sync**: Cursor-driven incremental fetch with throttling backoff
//! - **triage**: Classification through the collaborator with a rules fallback
//! - **reply**: Reply queue state machine, addressing and send-time overrides
//! - **jobs**: The gated top-level run and its scheduled tasks

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod store;
pub mod vault;

// Components
pub mod accounts;
pub mod jobs;
pub mod provider;
pub mod reply;
pub mod sync;
pub mod triage;

// Re-exports
pub use error::{MailHubError, Result};
