use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tracing::debug;

use crate::edit::KeyEditor;
use crate::card::CardOperator;
use crate::error::{Error, Result};
use crate::interactive::{GNUPG_STATUS, StatusLine};
use crate::parse::parse_keys;
use crate::process::ProcessHandle;
use crate::record::{RecordKind, parse_listing};
use crate::session::{CleanupPolicy, ProcessSession, SessionConfig, SpawnOptions, StderrMode};
use crate::types::{Key, KeyKind};
use crate::validation::{
    validate_expiration, validate_keyid, validate_passphrase, validate_protocol_line,
    validate_user_id_part,
};

const DEFAULT_PROGRAM: &str = "gpg";

/// Flags making gpg read passphrases from stdin instead of a pinentry.
const LOOPBACK_FLAGS: [&str; 4] = ["--pinentry-mode", "loopback", "--passphrase-fd", "0"];

/// Settings for a [`Gpg`] context.
#[derive(Debug, Clone)]
pub struct GpgConfig {
    /// Executable to run, `gpg` from `PATH` by default.
    pub program: String,
    /// Exported as `GNUPGHOME`. `None` uses gpg's own default.
    pub homedir: Option<PathBuf>,
    pub cleanup: CleanupPolicy,
    /// Upper bound for each one-shot invocation.
    pub timeout: Option<Duration>,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            homedir: None,
            cleanup: CleanupPolicy::default(),
            timeout: None,
        }
    }
}

impl GpgConfig {
    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn homedir(mut self, path: impl Into<PathBuf>) -> Self {
        self.homedir = Some(path.into());
        self
    }

    #[must_use]
    pub fn cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn session_config(&self) -> SessionConfig {
        let config = SessionConfig::default()
            .env("LC_ALL", "C")
            .cleanup(self.cleanup);
        match &self.homedir {
            Some(home) => config.env("GNUPGHOME", home.to_string_lossy()),
            None => config,
        }
    }
}

/// A gpg installation and home directory to run operations against.
///
/// Every invocation runs with `LC_ALL=C` so that gpg's diagnostics can be
/// matched reliably. Processes still running when the context is dropped are
/// handled according to [`GpgConfig::cleanup`].
///
/// # Example
///
/// ```no_run
/// # async fn example() -> gpgctl::Result<()> {
/// use gpgctl::{Gpg, KeyKind};
///
/// let gpg = Gpg::with_homedir("/tmp/gnupg-test");
/// for key in gpg.keys().list_keys(None, KeyKind::Public, true).await? {
///     println!("{} {:?}", key.key_id, key.fingerprint);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Gpg {
    config: GpgConfig,
    session: ProcessSession,
}

impl Default for Gpg {
    fn default() -> Self {
        Self::new()
    }
}

impl Gpg {
    /// Uses `gpg` from `PATH` with its default home directory.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GpgConfig::default())
    }

    #[must_use]
    pub fn with_homedir(path: impl Into<PathBuf>) -> Self {
        Self::with_config(GpgConfig::default().homedir(path))
    }

    #[must_use]
    pub fn with_config(config: GpgConfig) -> Self {
        let session = ProcessSession::new(config.session_config());
        Self { config, session }
    }

    pub fn config(&self) -> &GpgConfig {
        &self.config
    }

    pub fn homedir(&self) -> Option<&Path> {
        self.config.homedir.as_deref()
    }

    /// The session every gpg process of this context is spawned from.
    pub fn session(&self) -> &ProcessSession {
        &self.session
    }

    pub fn keys(&self) -> KeyOperator<'_> {
        KeyOperator { gpg: self }
    }

    pub fn card(&self) -> CardOperator<'_> {
        CardOperator::new(self)
    }

    /// Version reported by `gpg --list-config`.
    pub async fn version(&self) -> Result<String> {
        let handle = self
            .run_checked(["--with-colons", "--list-config"], None)
            .await?;
        let output = handle.output_text();
        parse_listing(&output)
            .records
            .iter()
            .filter(|r| *r.kind() == RecordKind::Config)
            .find(|r| r.field(2) == Some("version"))
            .and_then(|r| r.field(3))
            .map(str::to_string)
            .ok_or(Error::UnexpectedOutput(output))
    }

    /// Applies the cleanup policy to every process spawned so far.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    pub(crate) fn command<I, S>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        std::iter::once(self.config.program.clone())
            .chain(args.into_iter().map(Into::into))
            .collect()
    }

    /// Runs gpg to completion. A nonzero exit is not an error here.
    pub(crate) async fn run<I, S>(
        &self,
        args: I,
        input: Option<String>,
        options: SpawnOptions,
    ) -> Result<(ProcessHandle, ExitStatus)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = self.command(args);
        debug!(command = %shell_words::join(&argv), "running gpg");
        let handle = self
            .session
            .run_with(
                argv,
                options,
                input.as_deref().map(str::as_bytes),
                self.config.timeout,
            )
            .await?;
        let status = handle.wait(None).await?;
        debug!(pid = handle.pid(), ?status, "gpg finished");
        Ok((handle, status))
    }

    /// Runs gpg to completion and maps a nonzero exit to an error.
    pub(crate) async fn run_checked<I, S>(
        &self,
        args: I,
        input: Option<String>,
    ) -> Result<ProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (handle, status) = self.run(args, input, SpawnOptions::default()).await?;
        if !status.success() {
            return Err(self.check_error(status, &handle.output_text()));
        }
        Ok(handle)
    }

    pub(crate) fn check_error(&self, status: ExitStatus, output: &str) -> Error {
        check_gpg_error(self.homedir(), status, output)
    }
}

fn check_gpg_error(homedir: Option<&Path>, status: ExitStatus, output: &str) -> Error {
    if output.contains("Permission denied") || output.contains("permission denied") {
        return Error::PermissionDenied;
    }

    let mentions_keyring = match homedir {
        Some(home) => output.contains(home.to_string_lossy().as_ref()),
        None => output.contains("pubring"),
    };
    if output.contains("No such file or directory") && mentions_keyring {
        return Error::KeyringNotInitialized;
    }

    Error::Gpg {
        status: status.code().unwrap_or(-1),
        output: output.to_string(),
    }
}

/// Builds the stdin payload for `--passphrase-fd 0`: one line per
/// passphrase, an empty line for a missing one. `None` if nothing is given.
fn passphrase_input(passphrases: &[Option<&str>]) -> Result<Option<String>> {
    if passphrases.iter().all(Option::is_none) {
        return Ok(None);
    }
    let mut input = String::new();
    for passphrase in passphrases {
        input.push_str(validate_passphrase(passphrase.unwrap_or_default())?);
        input.push('\n');
    }
    Ok(Some(input))
}

fn fingerprint_of(key: &Key) -> Result<&str> {
    key.fingerprint.as_deref().ok_or_else(|| Error::InvalidInput {
        what: "key",
        reason: format!("key {} has no fingerprint", key.key_id),
    })
}

/// Formats a user ID the way gpg prints it: `Name (Comment) <email>`.
pub fn format_user_id(name: &str, email: Option<&str>, comment: Option<&str>) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput {
            what: "name",
            reason: "user ID name cannot be empty".to_string(),
        });
    }

    let mut uid = validate_user_id_part("name", name)?.trim().to_string();
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        let comment = validate_user_id_part("comment", comment)?;
        if comment.contains(['(', ')']) {
            return Err(Error::InvalidInput {
                what: "comment",
                reason: "must not contain parentheses".to_string(),
            });
        }
        uid.push_str(&format!(" ({comment})"));
    }
    if let Some(email) = email.filter(|e| !e.is_empty()) {
        uid.push_str(&format!(" <{}>", validate_user_id_part("email", email)?));
    }
    Ok(uid)
}

/// What a key may be used for, as accepted by `--quick-gen-key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyUsage {
    Sign,
    Encrypt,
    Authenticate,
    Certify,
}

impl KeyUsage {
    fn as_gpg(self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::Encrypt => "encr",
            Self::Authenticate => "auth",
            Self::Certify => "cert",
        }
    }
}

fn usage_arg(usage: &[KeyUsage]) -> String {
    if usage.is_empty() {
        return "default".to_string();
    }
    usage.iter().map(|u| u.as_gpg()).collect::<Vec<_>>().join(",")
}

fn expiration_arg(expiration: Option<&str>) -> Result<String> {
    match expiration {
        Some(e) => Ok(validate_expiration(e)?.to_string()),
        None => Ok("never".to_string()),
    }
}

/// Parameters for [`KeyOperator::generate_key`].
#[derive(Debug, Clone, Default)]
pub struct KeyGenParams {
    pub name: String,
    pub email: Option<String>,
    pub comment: Option<String>,
    /// Algorithm string such as `ed25519` or `rsa4096`; gpg's default if
    /// unset.
    pub algorithm: Option<String>,
    pub usage: Vec<KeyUsage>,
    /// Expiration in any form gpg accepts (`2y`, `2030-01-31`, ...).
    pub expiration: Option<String>,
    /// Leave unset for a key without passphrase.
    pub passphrase: Option<String>,
    /// Create the key even if a key with this user ID already exists.
    pub force: bool,
}

impl KeyGenParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }

    #[must_use]
    pub fn usage(mut self, usage: impl IntoIterator<Item = KeyUsage>) -> Self {
        self.usage = usage.into_iter().collect();
        self
    }

    #[must_use]
    pub fn expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    #[must_use]
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    fn args(&self) -> Result<Vec<String>> {
        let uid = format_user_id(&self.name, self.email.as_deref(), self.comment.as_deref())?;
        let mut args: Vec<String> = Vec::new();
        if self.force {
            args.push("--yes".into());
        }
        args.extend(["--batch", "--status-fd", "1"].map(String::from));
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.push("--quick-gen-key".into());
        args.push(uid);
        args.push(self.algorithm.clone().unwrap_or_else(|| "default".into()));
        args.push(usage_arg(&self.usage));
        args.push(expiration_arg(self.expiration.as_deref())?);
        Ok(args)
    }
}

/// Parameters for [`KeyOperator::add_subkey`].
#[derive(Debug, Clone, Default)]
pub struct SubkeyParams {
    pub algorithm: Option<String>,
    pub usage: Vec<KeyUsage>,
    pub expiration: Option<String>,
}

/// Which keys [`KeyOperator::set_expiration`] applies to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubkeySelection {
    #[default]
    Primary,
    AllSubkeys,
    Subkeys(Vec<String>),
}

/// `--export-options` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ExportOption {
    LocalSigs,
    Attributes,
    SensitiveRevkeys,
    Backup,
    Clean,
    Minimal,
    Revocs,
    Dane,
    Mode1003,
}

impl ExportOption {
    fn as_gpg(self) -> &'static str {
        match self {
            Self::LocalSigs => "export-local-sigs",
            Self::Attributes => "export-attributes",
            Self::SensitiveRevkeys => "export-sensitive-revkeys",
            Self::Backup => "backup",
            Self::Clean => "export-clean",
            Self::Minimal => "export-minimal",
            Self::Revocs => "export-revocs",
            Self::Dane => "export-dane",
            Self::Mode1003 => "mode1003",
        }
    }
}

/// `--export-filter` expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportFilter {
    KeepUid(String),
    DropSubkey(String),
}

impl fmt::Display for ExportFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepUid(expr) => write!(f, "keep-uid={expr}"),
            Self::DropSubkey(expr) => write!(f, "drop-subkey={expr}"),
        }
    }
}

/// Settings for [`KeyOperator::export`].
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// ASCII armor instead of binary packets.
    pub armor: bool,
    /// Needed to export secret keys that are protected.
    pub passphrase: Option<String>,
    /// Options to switch on (`true`) or off (`false`).
    pub options: Vec<(ExportOption, bool)>,
    pub filters: Vec<ExportFilter>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            armor: true,
            passphrase: None,
            options: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl ExportOptions {
    fn args(&self, fingerprint: &str, secret: bool) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if self.armor {
            args.push("--armor".into());
        }
        args.extend(["--batch", "--pinentry-mode", "loopback"].map(String::from));
        if self.passphrase.is_some() {
            args.extend(["--passphrase-fd", "0"].map(String::from));
        }
        if !self.options.is_empty() {
            let options = self
                .options
                .iter()
                .map(|(option, on)| {
                    let prefix = if *on { "" } else { "no-" };
                    format!("{prefix}{}", option.as_gpg())
                })
                .collect::<Vec<_>>()
                .join(",");
            args.push("--export-options".into());
            args.push(options);
        }
        for filter in &self.filters {
            args.push("--export-filter".into());
            args.push(filter.to_string());
        }
        args.push(if secret { "--export-secret-keys" } else { "--export" }.into());
        args.push(fingerprint.to_string());
        args
    }
}

/// Settings for [`KeyOperator::sign_key`].
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// User IDs to certify; all of them when empty.
    pub user_ids: Vec<String>,
    pub passphrase: Option<String>,
    /// Make a local (non-exportable) signature.
    pub local: bool,
    /// Sign even if an identical signature already exists.
    pub force: bool,
}

/// The key or subkey in `keys` named by `keyid`, an uppercase key ID or
/// fingerprint.
fn select_key(keys: Vec<Key>, keyid: &str) -> Option<Key> {
    fn named(key: &Key, keyid: &str) -> bool {
        key.key_id.to_ascii_uppercase().ends_with(keyid)
            || key
                .fingerprint
                .as_deref()
                .is_some_and(|f| f.to_ascii_uppercase().ends_with(keyid))
    }

    fn search(key: Key, keyid: &str) -> Option<Key> {
        if named(&key, keyid) {
            return Some(key);
        }
        key.subkeys.into_iter().find_map(|k| search(k, keyid))
    }

    keys.into_iter().find_map(|k| search(k, keyid))
}

fn list_args(pattern: Option<&str>, kind: KeyKind, check_sigs: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "--with-colons",
        "--with-fingerprint",
        "--with-subkey-fingerprint",
        "--with-keygrip",
        if check_sigs {
            "--with-sig-check"
        } else {
            "--with-sig-list"
        },
        kind.list_flag(),
    ]
    .map(String::from)
    .to_vec();
    if let Some(pattern) = pattern {
        args.push("--".into());
        args.push(pattern.to_string());
    }
    args
}

/// Key management operations on a [`Gpg`] context.
///
/// Operations that modify a key return the key freshly listed from the
/// keyring afterwards.
#[derive(Debug, Clone, Copy)]
pub struct KeyOperator<'a> {
    gpg: &'a Gpg,
}

impl<'a> KeyOperator<'a> {
    /// Lists keys matching `pattern`, or all keys.
    ///
    /// `check_sigs` verifies every signature (`--with-sig-check`); otherwise
    /// signatures are listed unverified.
    pub async fn list_keys(
        &self,
        pattern: Option<&str>,
        kind: KeyKind,
        check_sigs: bool,
    ) -> Result<Vec<Key>> {
        if let Some(pattern) = pattern {
            validate_protocol_line(pattern)?;
        }
        let (handle, status) = self
            .gpg
            .run(list_args(pattern, kind, check_sigs), None, SpawnOptions::default())
            .await?;
        let output = handle.output_text();

        if !status.success() {
            // A pattern matching nothing makes gpg fail.
            if output.contains("No public key") || output.contains("No secret key") {
                return Ok(Vec::new());
            }
            return Err(self.gpg.check_error(status, &output));
        }

        Ok(parse_keys(&output))
    }

    /// Finds one key by key ID or fingerprint.
    ///
    /// A subkey ID yields the subkey itself, not its primary key.
    pub async fn get_key(&self, keyid: &str, kind: KeyKind) -> Result<Option<Key>> {
        let keyid = validate_keyid(keyid)?;
        let keys = self.list_keys(Some(&keyid), kind, true).await?;
        Ok(select_key(keys, &keyid))
    }

    /// Lists `key` again, returning its current state.
    ///
    /// Fails with [`Error::KeyNotFound`] if the key is no longer in the
    /// keyring.
    pub async fn reload(&self, key: &Key) -> Result<Key> {
        let fingerprint = fingerprint_of(key)?;
        let kind = if key.secret {
            KeyKind::Secret
        } else {
            KeyKind::Public
        };
        self.get_key(fingerprint, kind)
            .await?
            .ok_or_else(|| Error::KeyNotFound(fingerprint.to_string()))
    }

    async fn find(&self, fingerprint: &str) -> Result<Key> {
        self.get_key(fingerprint, KeyKind::Public)
            .await?
            .ok_or_else(|| Error::KeyNotFound(fingerprint.to_string()))
    }

    /// Generates a new primary key and returns it.
    pub async fn generate_key(&self, params: &KeyGenParams) -> Result<Key> {
        let args = params.args()?;
        let input = passphrase_input(&[Some(params.passphrase.as_deref().unwrap_or_default())])?;
        let handle = self.gpg.run_checked(args, input).await?;
        let output = handle.output_text();

        let fingerprint = output
            .lines()
            .filter_map(|line| StatusLine::parse(line, GNUPG_STATUS))
            .find(|status| status.keyword == "KEY_CREATED")
            .and_then(|status| status.args.get(1).cloned())
            .ok_or_else(|| Error::UnexpectedOutput(output.clone()))?;
        debug!(%fingerprint, "generated key");

        self.find(&fingerprint).await
    }

    /// Exports `key`, as a secret key if it was listed from the secret
    /// keyring.
    pub async fn export(&self, key: &Key, options: &ExportOptions) -> Result<Vec<u8>> {
        let fingerprint = fingerprint_of(key)?;
        let input = passphrase_input(&[options.passphrase.as_deref()])?;
        // Diagnostics would corrupt binary output.
        let spawn = SpawnOptions::default().stderr(StderrMode::Discard);
        let (handle, status) = self
            .gpg
            .run(options.args(fingerprint, key.secret), input, spawn)
            .await?;
        if !status.success() {
            return Err(self.gpg.check_error(status, &handle.output_text()));
        }
        Ok(handle.output())
    }

    /// Sets the expiration of the primary key or of selected subkeys.
    /// `None` removes the expiration.
    pub async fn set_expiration(
        &self,
        key: &Key,
        expiration: Option<&str>,
        targets: &SubkeySelection,
        passphrase: Option<&str>,
    ) -> Result<Key> {
        let fingerprint = fingerprint_of(key)?;
        let expiration = match expiration {
            Some(e) => validate_expiration(e)?.to_string(),
            None => "0".to_string(),
        };

        let mut args = vec!["--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend(["--quick-set-expire".to_string(), fingerprint.to_string(), expiration]);
        match targets {
            SubkeySelection::Primary => {}
            SubkeySelection::AllSubkeys => args.push("*".into()),
            SubkeySelection::Subkeys(fingerprints) => {
                for fpr in fingerprints {
                    args.push(validate_keyid(fpr)?);
                }
            }
        }

        self.gpg
            .run_checked(args, passphrase_input(&[passphrase])?)
            .await?;
        self.reload(key).await
    }

    /// Whether the secret key is protected by a passphrase.
    pub async fn is_protected(&self, key: &Key) -> Result<bool> {
        self.try_passphrase(key, "").await.map(|accepted| !accepted)
    }

    /// Whether `passphrase` unlocks the secret key. Always true for an
    /// unprotected key.
    pub async fn check_passphrase(&self, key: &Key, passphrase: &str) -> Result<bool> {
        if !self.is_protected(key).await? {
            return Ok(true);
        }
        self.try_passphrase(key, passphrase).await
    }

    async fn try_passphrase(&self, key: &Key, passphrase: &str) -> Result<bool> {
        let fingerprint = fingerprint_of(key)?;
        let mut args = vec!["--dry-run".to_string(), "--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend(["--passwd".to_string(), fingerprint.to_string()]);

        let input = passphrase_input(&[Some(passphrase)])?;
        let (handle, _) = self.gpg.run(args, input, SpawnOptions::default()).await?;
        Ok(!handle.output_text().contains("error"))
    }

    /// Certifies `target` (a fingerprint) with `signer`'s key and returns the
    /// signed key.
    pub async fn sign_key(&self, signer: &Key, target: &str, options: &SignOptions) -> Result<Key> {
        let signer = fingerprint_of(signer)?;
        let target = validate_keyid(target)?;

        let mut args = vec!["--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend(["-u".to_string(), signer.to_string()]);
        if options.force {
            args.push("--force-sign-key".into());
        }
        args.push(if options.local { "--quick-lsign-key" } else { "--quick-sign-key" }.into());
        args.push(target.clone());
        for uid in &options.user_ids {
            args.push(validate_protocol_line(uid)?.to_string());
        }

        self.gpg
            .run_checked(args, passphrase_input(&[options.passphrase.as_deref()])?)
            .await?;
        self.find(&target).await
    }

    /// Adds a subkey to a primary key.
    ///
    /// `passphrase` unlocks the primary key; `subkey_passphrase` protects the
    /// new subkey.
    pub async fn add_subkey(
        &self,
        key: &Key,
        params: &SubkeyParams,
        passphrase: Option<&str>,
        subkey_passphrase: Option<&str>,
    ) -> Result<Key> {
        if key.is_subkey() {
            return Err(Error::InvalidInput {
                what: "key",
                reason: "cannot add a subkey to a subkey".to_string(),
            });
        }
        let fingerprint = fingerprint_of(key)?;

        let mut args = vec!["--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend(["--yes".to_string(), "--quick-add-key".to_string(), fingerprint.to_string()]);
        args.push(params.algorithm.clone().unwrap_or_else(|| "default".into()));
        args.push(usage_arg(&params.usage));
        args.push(expiration_arg(params.expiration.as_deref())?);

        let input = passphrase_input(&[Some(passphrase.unwrap_or_default()), subkey_passphrase])?;
        self.gpg.run_checked(args, input).await?;
        self.reload(key).await
    }

    /// Adds a user ID, e.g. one built with [`format_user_id`].
    pub async fn add_user_id(&self, key: &Key, uid: &str, passphrase: Option<&str>) -> Result<Key> {
        self.quick_uid_op(key, "--quick-add-uid", uid, passphrase).await
    }

    /// Revokes the user ID matching `uid` exactly.
    pub async fn revoke_user_id(&self, key: &Key, uid: &str, passphrase: Option<&str>) -> Result<Key> {
        self.quick_uid_op(key, "--quick-revoke-uid", uid, passphrase).await
    }

    pub async fn set_primary_user_id(
        &self,
        key: &Key,
        uid: &str,
        passphrase: Option<&str>,
    ) -> Result<Key> {
        self.quick_uid_op(key, "--quick-set-primary-uid", uid, passphrase).await
    }

    async fn quick_uid_op(
        &self,
        key: &Key,
        operation: &str,
        uid: &str,
        passphrase: Option<&str>,
    ) -> Result<Key> {
        let fingerprint = fingerprint_of(key)?;
        if uid.trim().is_empty() {
            return Err(Error::InvalidInput {
                what: "user ID",
                reason: "cannot be empty".to_string(),
            });
        }
        validate_protocol_line(uid)?;

        let mut args = vec!["--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend([operation.to_string(), fingerprint.to_string(), uid.to_string()]);

        self.gpg
            .run_checked(args, passphrase_input(&[passphrase])?)
            .await?;
        self.reload(key).await
    }

    /// Revokes the certifications `signer` made on `key`, on the given user
    /// IDs or all of them.
    pub async fn revoke_signature(
        &self,
        key: &Key,
        signer: &str,
        user_ids: &[&str],
        passphrase: Option<&str>,
    ) -> Result<Key> {
        let fingerprint = fingerprint_of(key)?;
        let signer = validate_keyid(signer)?;

        let mut args = vec!["--batch".to_string()];
        args.extend(LOOPBACK_FLAGS.map(String::from));
        args.extend(["--quick-revoke-sig".to_string(), fingerprint.to_string(), signer]);
        for uid in user_ids {
            args.push(validate_protocol_line(uid)?.to_string());
        }

        self.gpg
            .run_checked(args, passphrase_input(&[passphrase])?)
            .await?;
        self.reload(key).await
    }

    /// Opens an interactive `--edit-key` dialogue on `key`.
    pub async fn edit(&self, key: &Key) -> Result<KeyEditor> {
        KeyEditor::activate(self.gpg, fingerprint_of(key)?).await
    }
}
