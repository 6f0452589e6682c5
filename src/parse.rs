//! Reconstruction of key trees from a flat colon listing.
//!
//! gpg prints every key record at the same level: a primary key, its user
//! IDs and signatures, then each subkey with its own fingerprint and binding
//! signature. Which primary a subkey belongs to is recovered from the
//! signature made at the subkey's creation time: when its issuer is some
//! other key, the subkey is filed under that issuer.
//!
//! The rule relies on the binding signature carrying exactly the creation
//! timestamp of the key it binds. A signature made even a second later is
//! not recognised and the key is kept as a root.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::record::{KeyRecord, Record, RecordKind, parse_listing};
use crate::types::{Key, KeyRole, KeyType, Signature, UserId};

/// Parses a colon listing and builds its key forest in one step.
pub fn parse_keys(output: &str) -> Vec<Key> {
    let listing = parse_listing(output);
    build_key_forest(&listing.records)
}

/// Builds the forest of primary keys described by `records`.
///
/// Pure: the same records always produce the same forest.
pub fn build_key_forest(records: &[Record]) -> Vec<Key> {
    let mut builder = KeyTreeBuilder::default();
    for record in records {
        builder.push(record);
    }
    builder.finish()
}

/// Where a closed key ends up in the forest.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    Root,
    IssuedBy(String),
}

/// What a `sig`/`rev` record attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignatureTarget {
    Key,
    UserId(usize),
}

/// Incremental forest builder over listing records.
///
/// Keys live in an arena while the stream is scanned; parent links are
/// resolved by fingerprint once every key is known.
#[derive(Debug, Default)]
pub struct KeyTreeBuilder {
    arena: Vec<Key>,
    placements: Vec<Placement>,
    current: Option<usize>,
    target: Option<SignatureTarget>,
    /// The previous record opened the current key.
    fingerprint_due: bool,
}

impl KeyTreeBuilder {
    pub fn push(&mut self, record: &Record) {
        let fingerprint_due = std::mem::take(&mut self.fingerprint_due);
        match record {
            Record::Key(key) => {
                self.close_current();
                self.arena.push(key_from_record(key));
                self.current = Some(self.arena.len() - 1);
                self.target = Some(SignatureTarget::Key);
                self.fingerprint_due = true;
            }
            Record::Fingerprint(fpr) if *fpr.raw().kind() == RecordKind::Fingerprint => {
                if !fingerprint_due {
                    debug!("fingerprint record not directly after its key");
                    return;
                }
                if let Some(key) = self.current_key() {
                    key.fingerprint = fpr.fingerprint().map(str::to_string);
                }
            }
            // gpg lists designated revokers between a key and its fingerprint.
            Record::Generic(raw) if *raw.kind() == RecordKind::RevocationKey => {
                self.fingerprint_due = fingerprint_due;
            }
            Record::Keygrip(grp) => {
                if let Some(key) = self.current_key()
                    && key.keygrip.is_none()
                {
                    key.keygrip = grp.keygrip().map(str::to_string);
                }
            }
            Record::UserId(uid) => {
                let Some(key) = self.current_key() else {
                    debug!("user ID record before any key");
                    return;
                };
                let text = uid.uid().unwrap_or_default();
                let (name, email, comment) = UserId::split(&text);
                key.user_ids.push(UserId {
                    validity: uid.validity().unwrap_or_default(),
                    uid: text,
                    name,
                    email,
                    comment,
                    created: uid.created(),
                    expires: uid.expires(),
                    hash: uid.hash().map(str::to_string),
                    signatures: Vec::new(),
                });
                let index = key.user_ids.len() - 1;
                self.target = Some(SignatureTarget::UserId(index));
            }
            Record::Signature(sig) => {
                let signature = Signature {
                    validity: sig.validity(),
                    algorithm: sig.algorithm(),
                    key_id: sig.key_id().unwrap_or_default().to_string(),
                    created: sig.created(),
                    expires: sig.expires(),
                    signer_uid: sig.signer_uid(),
                    class: sig.class().map(str::to_string),
                    signer_fingerprint: sig.signer_fingerprint().map(str::to_string),
                    revocation: sig.is_revocation(),
                };
                let target = self.target;
                let Some(key) = self.current_key() else {
                    debug!("signature record before any key");
                    return;
                };
                match target {
                    Some(SignatureTarget::UserId(i)) if i < key.user_ids.len() => {
                        key.user_ids[i].signatures.push(signature);
                    }
                    _ => key.signatures.push(signature),
                }
            }
            Record::Generic(raw) if *raw.kind() == RecordKind::UserAttribute => {
                // Signatures on a photo ID are kept with the key itself.
                self.target = Some(SignatureTarget::Key);
            }
            other => {
                trace!(record_type = other.kind().tag(), "record not part of key tree");
            }
        }
    }

    /// Closes the last key and assembles the forest.
    pub fn finish(mut self) -> Vec<Key> {
        self.close_current();

        let roots: HashMap<String, usize> = self
            .placements
            .iter()
            .enumerate()
            .filter(|(_, p)| **p == Placement::Root)
            .filter_map(|(i, _)| {
                let fingerprint = self.arena[i].fingerprint.as_deref()?;
                Some((fingerprint.to_ascii_uppercase(), i))
            })
            .collect();

        let parents: Vec<Option<usize>> = self
            .placements
            .iter()
            .enumerate()
            .map(|(i, placement)| match placement {
                Placement::Root => None,
                Placement::IssuedBy(signer) => {
                    let parent = roots.get(&signer.to_ascii_uppercase()).copied();
                    if parent.is_none() {
                        debug!(key_id = %self.arena[i].key_id, signer = %signer, "issuer not in listing; keeping key as root");
                    }
                    parent
                }
            })
            .collect();

        let mut children: Vec<Vec<Key>> = vec![Vec::new(); self.arena.len()];
        let mut slots: Vec<Option<Key>> = self.arena.into_iter().map(Some).collect();

        for (i, parent) in parents.iter().enumerate() {
            if let Some(parent) = parent
                && let Some(key) = slots[i].take()
            {
                children[*parent].push(key);
            }
        }

        slots
            .into_iter()
            .zip(children)
            .filter_map(|(slot, subkeys)| {
                let mut key = slot?;
                key.subkeys.extend(subkeys);
                Some(key)
            })
            .collect()
    }

    fn current_key(&mut self) -> Option<&mut Key> {
        self.current.map(|i| &mut self.arena[i])
    }

    fn close_current(&mut self) {
        let Some(index) = self.current.take() else {
            return;
        };
        self.target = None;
        let placement = placement_of(&self.arena[index]);
        trace!(key_id = %self.arena[index].key_id, ?placement, "closed key");
        self.placements.push(placement);
    }
}

/// Applies the self-signature rule to a fully collected key.
fn placement_of(key: &Key) -> Placement {
    let Some(created) = key.created else {
        return Placement::Root;
    };
    // Ties go to the first signature in stream order.
    let Some(self_signature) = key.all_signatures().find(|s| s.created == Some(created)) else {
        return Placement::Root;
    };
    let Some(signer) = self_signature.signer_fingerprint.as_deref() else {
        return Placement::Root;
    };

    match key.fingerprint.as_deref() {
        Some(own) if own.eq_ignore_ascii_case(signer) => Placement::Root,
        _ => Placement::IssuedBy(signer.to_string()),
    }
}

fn key_from_record(record: &KeyRecord) -> Key {
    Key {
        role: if record.is_primary() {
            KeyRole::Primary
        } else {
            KeyRole::Subkey
        },
        secret: record.is_secret(),
        validity: record.validity().unwrap_or_default(),
        key_type: KeyType::new(
            record.algorithm().unwrap_or_default(),
            record.length().unwrap_or_default(),
        ),
        key_id: record.key_id().unwrap_or_default().to_string(),
        fingerprint: None,
        keygrip: None,
        created: record.created(),
        expires: record.expires(),
        owner_trust: record.owner_trust(),
        capabilities: record.capabilities(),
        overall_capabilities: record.overall_capabilities(),
        curve: record.curve().map(str::to_string),
        token_serial: record.token_serial().map(str::to_string),
        user_ids: Vec::new(),
        signatures: Vec::new(),
        subkeys: Vec::new(),
    }
}
