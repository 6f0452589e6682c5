use chrono::{DateTime, Utc};

/// Point in time as reported by gpg (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Which keyring a listing reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyKind {
    #[default]
    Public,
    Secret,
}

impl KeyKind {
    pub(crate) fn list_flag(self) -> &'static str {
        match self {
            Self::Public => "--list-public-keys",
            Self::Secret => "--list-secret-keys",
        }
    }
}

/// Whether a key record was emitted as a primary key or a subkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    Primary,
    Subkey,
}

/// The cryptographic algorithm and key size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyType {
    pub algorithm: String,
    pub algorithm_id: u16,
    pub bits: u32,
}

impl KeyType {
    pub(crate) fn new(algorithm_id: u16, bits: u32) -> Self {
        Self {
            algorithm: algorithm_name(algorithm_id),
            algorithm_id,
            bits,
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.algorithm.to_lowercase(), self.bits)
    }
}

/// Human-readable name for an OpenPGP public-key algorithm id.
pub fn algorithm_name(id: u16) -> String {
    match id {
        1..=3 => "RSA".to_string(),
        16 | 20 => "Elgamal".to_string(),
        17 => "DSA".to_string(),
        18 => "ECDH".to_string(),
        19 => "ECDSA".to_string(),
        22 => "EdDSA".to_string(),
        _ => format!("ALG{id}"),
    }
}

/// Validity of a key or user ID, from the second field of a listing line.
///
/// This is how confident gpg is that a key belongs to its claimed identity,
/// not the owner trust assigned to the key holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum Validity {
    /// Unknown (new key or insufficient data)
    #[default]
    Unknown,
    /// Invalid, e.g. missing self-signature
    Invalid,
    Disabled,
    Revoked,
    Expired,
    /// No validity assigned (`-`)
    NotAssigned,
    /// Undefined (not yet computed)
    Undefined,
    /// Explicitly not valid
    Never,
    Marginal,
    Full,
    Ultimate,
    /// Well-known private part
    WellKnown,
    /// Special validity (e.g. for TOFU)
    Special,
}

impl Validity {
    pub fn from_gpg_char(c: char) -> Self {
        match c {
            'o' => Self::Unknown,
            'i' => Self::Invalid,
            'd' => Self::Disabled,
            'r' => Self::Revoked,
            'e' => Self::Expired,
            '-' => Self::NotAssigned,
            'q' => Self::Undefined,
            'n' => Self::Never,
            'm' => Self::Marginal,
            'f' => Self::Full,
            'u' => Self::Ultimate,
            'w' => Self::WellKnown,
            's' => Self::Special,
            _ => Self::Unknown,
        }
    }
}

/// Outcome of a signature check, from `--with-sig-check` listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureValidity {
    Good,
    Bad,
    NoPublicKey,
    Error,
}

impl SignatureValidity {
    pub fn from_gpg_char(c: char) -> Option<Self> {
        match c {
            '!' => Some(Self::Good),
            '-' => Some(Self::Bad),
            '?' => Some(Self::NoPublicKey),
            '%' => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum KeyCapability {
    Encrypt,
    Sign,
    Certify,
    Authenticate,
    RestrictedEncrypt,
    Timestamp,
    Group,
    Disabled,
    Unknown,
}

impl KeyCapability {
    /// Maps one capability letter, ignoring case.
    pub fn from_gpg_char(c: char) -> Self {
        match c.to_ascii_lowercase() {
            'e' => Self::Encrypt,
            's' => Self::Sign,
            'c' => Self::Certify,
            'a' => Self::Authenticate,
            'r' => Self::RestrictedEncrypt,
            't' => Self::Timestamp,
            'g' => Self::Group,
            'd' => Self::Disabled,
            _ => Self::Unknown,
        }
    }
}

/// Why the trust database is considered stale (`tru` records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStaleness {
    Old,
    DifferentModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustModel {
    Classic,
    Pgp,
    Other(u8),
}

/// A certification found in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub validity: Option<SignatureValidity>,
    pub algorithm: Option<u16>,
    pub key_id: String,
    pub created: Option<Timestamp>,
    pub expires: Option<Timestamp>,
    /// User ID of the signer, when gpg knows it.
    pub signer_uid: Option<String>,
    /// Signature class, e.g. `13x` or `18x`.
    pub class: Option<String>,
    /// Issuer fingerprint, when disclosed by the signature.
    pub signer_fingerprint: Option<String>,
    pub revocation: bool,
}

/// A user ID and the certifications attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId {
    pub validity: Validity,
    pub uid: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub comment: Option<String>,
    pub created: Option<Timestamp>,
    pub expires: Option<Timestamp>,
    pub hash: Option<String>,
    pub signatures: Vec<Signature>,
}

impl UserId {
    /// Splits a `Name (Comment) <email>` string into its parts.
    pub fn split(uid: &str) -> (Option<String>, Option<String>, Option<String>) {
        let mut rest = uid.to_string();

        let email = match (rest.rfind('<'), rest.rfind('>')) {
            (Some(open), Some(close)) if open < close => {
                let email = rest[open + 1..close].trim().to_string();
                rest.replace_range(open..=close, "");
                Some(email)
            }
            _ => None,
        };

        let comment = match (rest.find('('), rest.rfind(')')) {
            (Some(open), Some(close)) if open < close => {
                let comment = rest[open + 1..close].trim().to_string();
                rest.replace_range(open..=close, "");
                Some(comment)
            }
            _ => None,
        };

        let name = rest.trim();
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        (
            non_empty(name.to_string()),
            email.and_then(non_empty),
            comment.and_then(non_empty),
        )
    }
}

/// A primary key or subkey reconstructed from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub role: KeyRole,
    /// Listed from the secret keyring.
    pub secret: bool,
    pub validity: Validity,
    pub key_type: KeyType,
    pub key_id: String,
    pub fingerprint: Option<String>,
    pub keygrip: Option<String>,
    pub created: Option<Timestamp>,
    pub expires: Option<Timestamp>,
    pub owner_trust: Option<Validity>,
    pub capabilities: Vec<KeyCapability>,
    pub overall_capabilities: Vec<KeyCapability>,
    pub curve: Option<String>,
    /// Serial number of the token holding the secret part, `+` if the
    /// secret is present locally, `#` if it is a stub.
    pub token_serial: Option<String>,
    pub user_ids: Vec<UserId>,
    /// Signatures attached directly to the key rather than to a user ID,
    /// such as subkey binding signatures.
    pub signatures: Vec<Signature>,
    pub subkeys: Vec<Key>,
}

impl Key {
    pub fn is_subkey(&self) -> bool {
        self.role == KeyRole::Subkey
    }

    pub fn can(&self, capability: KeyCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Every signature on this key in listing order: direct signatures
    /// first, then each user ID's.
    pub fn all_signatures(&self) -> impl Iterator<Item = &Signature> {
        self.signatures
            .iter()
            .chain(self.user_ids.iter().flat_map(|uid| uid.signatures.iter()))
    }

    /// Number of keys in this tree, including this one.
    pub fn tree_size(&self) -> usize {
        1 + self.subkeys.iter().map(Key::tree_size).sum::<usize>()
    }

    /// Looks up a subkey (or this key) by fingerprint, case-insensitively.
    pub fn find(&self, fingerprint: &str) -> Option<&Key> {
        if self
            .fingerprint
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(fingerprint))
        {
            return Some(self);
        }
        self.subkeys.iter().find_map(|k| k.find(fingerprint))
    }
}
