#![doc = "mochi-sync-core: synchronisation engine for mochi-sync."]

//! Mirrors a directory of markdown notes into remote flashcard decks.
//! Directories become decks (nested like the directory tree), files become
//! one or more cards, and a JSON lock file remembers which remote ids belong
//! to which local paths.
//!
//! The remote service is reached through the [`contract::Client`] trait; the
//! HTTP implementation lives in the `mochi-sync` binary crate.
//!
//! # Usage
//! Build a [`config::SynchroniseConfig`], load a [`lock::Lock`], and call
//! [`synchronise::synchronise`] with a client.

pub mod config;
pub mod contract;
pub mod convert;
pub mod differ;
pub mod executor;
pub mod grouper;
pub mod lock;
pub mod operation;
pub mod pagination;
pub mod ratelimit;
pub mod resolver;
pub mod synchronise;
pub mod walk;
