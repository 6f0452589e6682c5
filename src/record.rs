//! Tokenizer for gpg's colon-delimited `--with-colons` output.
//!
//! Each line becomes a [`Record`]. Field numbering follows gpg's `DETAILS`
//! document: field 1 is the record type, fields 2 and up are positional
//! data, and an empty field is reported as absent. Typed accessors interpret
//! fields on demand, so one malformed field never hides the others.

use chrono::{DateTime, NaiveDateTime};
use tracing::debug;

use crate::types::{
    KeyCapability, SignatureValidity, Timestamp, TrustModel, TrustStaleness, Validity,
};

/// Highest field number gpg documents for listing records.
pub const MAX_FIELDS: usize = 21;

/// The closed set of record types gpg emits in colon listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKind {
    PublicKey,
    X509Certificate,
    X509CertificateWithSecret,
    Subkey,
    SecretKey,
    SecretSubkey,
    UserId,
    UserAttribute,
    Signature,
    Revocation,
    StandaloneRevocation,
    Fingerprint,
    Sha256Fingerprint,
    PublicKeyData,
    Keygrip,
    RevocationKey,
    TofuData,
    TrustInfo,
    SignatureSubpacket,
    Config,
    /// A record type this crate does not know about.
    Unknown(String),
}

const TAGS: &[(&str, RecordKind)] = &[
    ("pub", RecordKind::PublicKey),
    ("crt", RecordKind::X509Certificate),
    ("crs", RecordKind::X509CertificateWithSecret),
    ("sub", RecordKind::Subkey),
    ("sec", RecordKind::SecretKey),
    ("ssb", RecordKind::SecretSubkey),
    ("uid", RecordKind::UserId),
    ("uat", RecordKind::UserAttribute),
    ("sig", RecordKind::Signature),
    ("rev", RecordKind::Revocation),
    ("rvs", RecordKind::StandaloneRevocation),
    ("fpr", RecordKind::Fingerprint),
    ("fp2", RecordKind::Sha256Fingerprint),
    ("pkd", RecordKind::PublicKeyData),
    ("grp", RecordKind::Keygrip),
    ("rvk", RecordKind::RevocationKey),
    ("tfs", RecordKind::TofuData),
    ("tru", RecordKind::TrustInfo),
    ("spk", RecordKind::SignatureSubpacket),
    ("cfg", RecordKind::Config),
];

impl RecordKind {
    pub fn from_tag(tag: &str) -> Self {
        TAGS.iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| Self::Unknown(tag.to_string()))
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Unknown(tag) => tag,
            known => TAGS
                .iter()
                .find(|(_, kind)| kind == known)
                .map(|(tag, _)| *tag)
                .unwrap_or_default(),
        }
    }

    /// Maximum number of fields (including the type field) a line of this
    /// kind may carry. `cfg` lines are free-form.
    pub fn max_fields(&self) -> Option<usize> {
        match self {
            Self::Config | Self::Unknown(_) => None,
            _ => Some(MAX_FIELDS),
        }
    }

    /// Records that describe a key (and so open a new key in a listing).
    pub fn is_key(&self) -> bool {
        matches!(
            self,
            Self::PublicKey
                | Self::Subkey
                | Self::SecretKey
                | Self::SecretSubkey
                | Self::X509Certificate
                | Self::X509CertificateWithSecret
        )
    }
}

/// A listing line split into fields, with no interpretation applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    kind: RecordKind,
    /// Fields 2 and up; `None` for empty fields.
    fields: Vec<Option<String>>,
}

impl RawRecord {
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Field `n` (1-based). Field 1 is the record type. Empty and missing
    /// fields are both `None`.
    pub fn field(&self, n: usize) -> Option<&str> {
        match n {
            0 => None,
            1 => Some(self.kind.tag()).filter(|t| !t.is_empty()),
            n => self.fields.get(n - 2).and_then(|f| f.as_deref()),
        }
    }

    /// Number of fields present on the line, including the type field.
    pub fn field_count(&self) -> usize {
        self.fields.len() + 1
    }

    fn char_field(&self, n: usize) -> Option<char> {
        self.field(n).and_then(|f| f.chars().next())
    }

    fn number<T: std::str::FromStr>(&self, n: usize) -> Option<T> {
        self.field(n).and_then(|f| f.parse().ok())
    }

    fn timestamp(&self, n: usize) -> Option<Timestamp> {
        self.field(n).and_then(parse_timestamp)
    }

    fn unescaped(&self, n: usize) -> Option<String> {
        self.field(n).map(unescape)
    }
}

/// `pub`, `sub`, `sec`, `ssb`, `crt` and `crs` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord(RawRecord);

impl KeyRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn is_primary(&self) -> bool {
        !matches!(self.0.kind, RecordKind::Subkey | RecordKind::SecretSubkey)
    }

    pub fn is_secret(&self) -> bool {
        matches!(
            self.0.kind,
            RecordKind::SecretKey | RecordKind::SecretSubkey | RecordKind::X509CertificateWithSecret
        )
    }

    pub fn validity(&self) -> Option<Validity> {
        self.0.char_field(2).map(Validity::from_gpg_char)
    }

    pub fn length(&self) -> Option<u32> {
        self.0.number(3)
    }

    pub fn algorithm(&self) -> Option<u16> {
        self.0.number(4)
    }

    pub fn key_id(&self) -> Option<&str> {
        self.0.field(5)
    }

    pub fn created(&self) -> Option<Timestamp> {
        self.0.timestamp(6)
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.0.timestamp(7)
    }

    pub fn owner_trust(&self) -> Option<Validity> {
        self.0.char_field(9).map(Validity::from_gpg_char)
    }

    /// Capabilities of this key alone (lowercase letters of field 12).
    pub fn capabilities(&self) -> Vec<KeyCapability> {
        self.capability_letters(|c| c.is_ascii_lowercase())
    }

    /// Capabilities of the whole key including its subkeys (uppercase
    /// letters of field 12).
    pub fn overall_capabilities(&self) -> Vec<KeyCapability> {
        self.capability_letters(|c| c.is_ascii_uppercase())
    }

    fn capability_letters(&self, pick: impl Fn(char) -> bool) -> Vec<KeyCapability> {
        self.0
            .field(12)
            .map(|f| f.chars().filter(|&c| pick(c)).map(KeyCapability::from_gpg_char).collect())
            .unwrap_or_default()
    }

    pub fn token_serial(&self) -> Option<&str> {
        self.0.field(15)
    }

    pub fn curve(&self) -> Option<&str> {
        self.0.field(17)
    }
}

/// `fpr` and `fp2` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord(RawRecord);

impl FingerprintRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.0.field(10)
    }
}

/// `grp` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygripRecord(RawRecord);

impl KeygripRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn keygrip(&self) -> Option<&str> {
        self.0.field(10)
    }
}

/// `uid` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdRecord(RawRecord);

impl UserIdRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn validity(&self) -> Option<Validity> {
        self.0.char_field(2).map(Validity::from_gpg_char)
    }

    pub fn created(&self) -> Option<Timestamp> {
        self.0.timestamp(6)
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.0.timestamp(7)
    }

    pub fn hash(&self) -> Option<&str> {
        self.0.field(8)
    }

    /// The user ID string with gpg's `\xHH` escapes decoded.
    pub fn uid(&self) -> Option<String> {
        self.0.unescaped(10)
    }
}

/// `sig`, `rev` and `rvs` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord(RawRecord);

impl SignatureRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn is_revocation(&self) -> bool {
        !matches!(self.0.kind, RecordKind::Signature)
    }

    pub fn validity(&self) -> Option<SignatureValidity> {
        self.0.char_field(2).and_then(SignatureValidity::from_gpg_char)
    }

    pub fn algorithm(&self) -> Option<u16> {
        self.0.number(4)
    }

    pub fn key_id(&self) -> Option<&str> {
        self.0.field(5)
    }

    pub fn created(&self) -> Option<Timestamp> {
        self.0.timestamp(6)
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.0.timestamp(7)
    }

    pub fn signer_uid(&self) -> Option<String> {
        self.0.unescaped(10)
    }

    pub fn class(&self) -> Option<&str> {
        self.0.field(11)
    }

    pub fn signer_fingerprint(&self) -> Option<&str> {
        self.0.field(13)
    }
}

/// `tru` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRecord(RawRecord);

impl TrustRecord {
    pub fn raw(&self) -> &RawRecord {
        &self.0
    }

    pub fn staleness(&self) -> Option<TrustStaleness> {
        match self.0.char_field(2)? {
            'o' => Some(TrustStaleness::Old),
            't' => Some(TrustStaleness::DifferentModel),
            _ => None,
        }
    }

    pub fn trust_model(&self) -> Option<TrustModel> {
        Some(match self.0.number::<u8>(3)? {
            0 => TrustModel::Classic,
            1 => TrustModel::Pgp,
            other => TrustModel::Other(other),
        })
    }

    pub fn created(&self) -> Option<Timestamp> {
        self.0.timestamp(4)
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.0.timestamp(5)
    }

    pub fn marginals_needed(&self) -> Option<u32> {
        self.0.number(6)
    }

    pub fn completes_needed(&self) -> Option<u32> {
        self.0.number(7)
    }

    pub fn max_cert_depth(&self) -> Option<u32> {
        self.0.number(8)
    }
}

/// One parsed listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Key(KeyRecord),
    Fingerprint(FingerprintRecord),
    Keygrip(KeygripRecord),
    UserId(UserIdRecord),
    Signature(SignatureRecord),
    Trust(TrustRecord),
    /// Any other kind, including unknown ones, with its raw fields.
    Generic(RawRecord),
}

impl Record {
    fn from_raw(raw: RawRecord) -> Self {
        match raw.kind {
            RecordKind::PublicKey
            | RecordKind::Subkey
            | RecordKind::SecretKey
            | RecordKind::SecretSubkey
            | RecordKind::X509Certificate
            | RecordKind::X509CertificateWithSecret => Self::Key(KeyRecord(raw)),
            RecordKind::Fingerprint | RecordKind::Sha256Fingerprint => {
                Self::Fingerprint(FingerprintRecord(raw))
            }
            RecordKind::Keygrip => Self::Keygrip(KeygripRecord(raw)),
            RecordKind::UserId => Self::UserId(UserIdRecord(raw)),
            RecordKind::Signature | RecordKind::Revocation | RecordKind::StandaloneRevocation => {
                Self::Signature(SignatureRecord(raw))
            }
            RecordKind::TrustInfo => Self::Trust(TrustRecord(raw)),
            RecordKind::UserAttribute
            | RecordKind::PublicKeyData
            | RecordKind::RevocationKey
            | RecordKind::TofuData
            | RecordKind::SignatureSubpacket
            | RecordKind::Config
            | RecordKind::Unknown(_) => Self::Generic(raw),
        }
    }

    pub fn raw(&self) -> &RawRecord {
        match self {
            Self::Key(r) => r.raw(),
            Self::Fingerprint(r) => r.raw(),
            Self::Keygrip(r) => r.raw(),
            Self::UserId(r) => r.raw(),
            Self::Signature(r) => r.raw(),
            Self::Trust(r) => r.raw(),
            Self::Generic(r) => r,
        }
    }

    pub fn kind(&self) -> &RecordKind {
        self.raw().kind()
    }

    pub fn field(&self, n: usize) -> Option<&str> {
        self.raw().field(n)
    }
}

/// A listing line that did not fully match the known format. The line is
/// still returned as a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAnomaly {
    /// 1-based line number within the parsed output.
    pub line: usize,
    pub reason: AnomalyReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyReason {
    UnknownKind(String),
    TooManyFields { max: usize, found: usize },
}

/// Records of one listing invocation, in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub records: Vec<Record>,
    pub anomalies: Vec<ParseAnomaly>,
}

/// Parses one listing line. Never fails: unknown kinds come back as
/// [`Record::Generic`].
pub fn parse_record(line: &str) -> Record {
    parse_line(line).0
}

fn parse_line(line: &str) -> (Record, Option<AnomalyReason>) {
    let mut parts = line.split(':');
    let tag = parts.next().unwrap_or_default();
    let kind = RecordKind::from_tag(tag);
    let mut fields: Vec<Option<String>> = parts
        .map(|f| (!f.is_empty()).then(|| f.to_string()))
        .collect();

    let mut anomaly = None;
    if let RecordKind::Unknown(tag) = &kind {
        anomaly = Some(AnomalyReason::UnknownKind(tag.clone()));
    } else if let Some(max) = kind.max_fields()
        && fields.len() + 1 > max
    {
        // gpg terminates most lines with a colon; an empty trailing field
        // past the last documented one is not worth reporting.
        let found = fields.len() + 1;
        let extra_is_data = fields[max - 1..].iter().any(Option::is_some);
        fields.truncate(max - 1);
        if extra_is_data {
            anomaly = Some(AnomalyReason::TooManyFields { max, found });
        }
    }

    (Record::from_raw(RawRecord { kind, fields }), anomaly)
}

/// Parses a complete listing, skipping blank lines and gpg's own `gpg: `
/// diagnostics.
pub fn parse_listing(output: &str) -> Listing {
    let mut listing = Listing::default();

    for (index, line) in output.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with("gpg: ") {
            continue;
        }

        let (record, anomaly) = parse_line(line);
        if let Some(reason) = anomaly {
            debug!(line = index + 1, record_type = record.kind().tag(), ?reason, "irregular listing record");
            listing.anomalies.push(ParseAnomaly {
                line: index + 1,
                reason,
            });
        }
        listing.records.push(record);
    }

    listing
}

/// Interprets a gpg date field: seconds since the epoch, or an ISO 8601
/// timestamp such as `20240102T030405`.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    if s.is_empty() {
        return None;
    }
    if s.contains('T') {
        return NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
            .map(|dt| dt.and_utc())
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.to_utc()));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}

/// Decodes the `\xHH` escapes gpg applies to user IDs in colon listings.
pub fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(hex) = field.get(i + 2..i + 4)
            && hex.bytes().all(|b| b.is_ascii_hexdigit())
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
