//! Async control layer over the `gpg` command-line tool.
//!
//! gpg is driven as a subprocess: one-shot invocations whose colon-delimited
//! listings are parsed into key trees, and long-lived `--edit-key` /
//! `--card-edit` dialogues conducted over its status and command file
//! descriptors.
//!
//! # Example
//!
//! ```no_run
//! use gpgctl::{Gpg, KeyKind};
//!
//! #[tokio::main]
//! async fn main() -> gpgctl::Result<()> {
//!     let gpg = Gpg::new();
//!
//!     let keys = gpg.keys().list_keys(None, KeyKind::Public, true).await?;
//!     for key in keys {
//!         let uid = key.user_ids.first().map(|u| u.uid.as_str()).unwrap_or("");
//!         println!("{} {} ({} subkeys)", key.key_id, uid, key.subkeys.len());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! The process layer is usable on its own for any line-oriented tool:
//!
//! ```no_run
//! # async fn example() -> gpgctl::Result<()> {
//! use std::time::Duration;
//! use gpgctl::ProcessSession;
//!
//! let session = ProcessSession::default();
//! let handle = session.spawn("ping -c 3 localhost", Default::default())?;
//! let mut lines = handle.lines();
//! while let Some(line) = lines.next_line().await {
//!     println!("{line}");
//! }
//! handle.wait(Some(Duration::from_secs(10))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! - GnuPG 2.1 or newer on `PATH` (or configured through [`GpgConfig`])
//! - A Tokio runtime; every spawn happens on the current runtime

mod card;
mod edit;
mod error;
mod interactive;
mod keyring;
mod parse;
mod process;
mod record;
mod session;
mod types;
mod validation;

pub use card::{
    CardEditor, CardOperator, KeyAttribute, PinData, Sex, SmartCard, StoredKey, UifSettings,
};
pub use edit::{KeyEditor, RevocationReason};
pub use error::{Error, Result};
pub use interactive::{
    DriverConfig, DriverState, GNUPG_PROTOCOL_FLAGS, GNUPG_STATUS, PromptMatch, StatusDriver,
    StatusLine, Transcript,
};
pub use keyring::{
    ExportFilter, ExportOption, ExportOptions, Gpg, GpgConfig, KeyGenParams, KeyOperator,
    KeyUsage, SignOptions, SubkeyParams, SubkeySelection, format_user_id,
};
pub use parse::{KeyTreeBuilder, build_key_forest, parse_keys};
pub use process::{LineCursor, ProcessHandle};
pub use record::{
    AnomalyReason, FingerprintRecord, KeyRecord, KeygripRecord, Listing, MAX_FIELDS,
    ParseAnomaly, RawRecord, Record, RecordKind, SignatureRecord, TrustRecord, UserIdRecord,
    parse_listing, parse_record, parse_timestamp, unescape,
};
pub use session::{
    CleanupPolicy, CommandLine, ProcessSession, SessionConfig, SpawnOptions, StderrMode,
};
pub use types::{
    Key, KeyCapability, KeyKind, KeyRole, KeyType, Signature, SignatureValidity, Timestamp,
    TrustModel, TrustStaleness, UserId, Validity, algorithm_name,
};
pub use validation::{
    validate_expiration, validate_keyid, validate_passphrase, validate_protocol_line,
    validate_user_id_part,
};
