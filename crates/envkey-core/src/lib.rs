//! # envkey-core
//!
//! The end-to-end secret-fetch pipeline: parse an ENVKEY credential, fetch
//! its encrypted blob over HTTPS (with failover endpoints and a disk-cache
//! fallback), verify the signed trust graph, decrypt every blob family, and
//! fold the result into a flat `{VAR -> value}` map.
//!
//! The daemon and CLI crates build on this; nothing here knows about
//! daemons, sockets, or child processes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use envkey_core::{fetch_map, FetchOptions};
//!
//! # async fn run() -> envkey_core::Result<()> {
//! let env = fetch_map("ekAc3fZk-8xPz41dSaQ", FetchOptions::default()).await?;
//! for (key, value) in &env {
//!     println!("{key}={value}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod defaults;
pub mod envkey;
pub mod error;
pub mod fetch;
pub mod models;
pub mod parser;
pub mod test_fixtures;
pub mod trust;

pub use cache::Cache;
pub use envkey::{id_part, Envkey};
pub use error::{Error, Result};
pub use fetch::{fetch, fetch_map, FetchClient, FetchOptions};
pub use models::{
    EnvMap, FetchResponse, InheritanceOverrides, KeyableBlob, KeyableBlobFields, KeyableEnv,
    KeyableEnvVal, RootPubkeyReplacement,
};
pub use parser::ParsedEnv;
pub use trust::{Signer, TrustedKeyable, TrustedKeyablesChain, TrustedKeyablesMap};
