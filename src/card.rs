//! OpenPGP smartcard status and administration.

use std::collections::HashMap;

use tracing::debug;

use crate::edit::expect_success;
use crate::error::Result;
use crate::interactive::{DriverConfig, GNUPG_PROTOCOL_FLAGS, StatusDriver, Transcript};
use crate::keyring::Gpg;
use crate::record::parse_timestamp;
use crate::session::SpawnOptions;
use crate::types::Timestamp;

const CARDEDIT_PROMPT: &str = "cardedit.prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sex {
    #[default]
    Unset,
    Female,
    Male,
}

impl Sex {
    fn from_gpg(field: Option<&str>) -> Self {
        match field {
            Some("f") => Self::Female,
            Some("m") => Self::Male,
            _ => Self::Unset,
        }
    }
}

/// A value per PIN kind: user PIN, reset code, admin PIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinData<T> {
    pub pin: T,
    pub reset: T,
    pub admin: T,
}

/// Whether each key slot requires a touch to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UifSettings {
    pub sign: bool,
    pub decrypt: bool,
    pub auth: bool,
}

/// Algorithm configured for one key slot (`keyattr` lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAttribute {
    /// 1 signature, 2 encryption, 3 authentication.
    pub slot: u8,
    pub algorithm: u16,
    /// Key size for RSA, curve name for ECC.
    pub parameter: String,
}

/// A key stored in one card slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredKey {
    pub fingerprint: Option<String>,
    pub created: Option<Timestamp>,
    pub keygrip: Option<String>,
}

/// Card state as reported by `gpg --card-status --with-colons`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmartCard {
    pub reader: Option<String>,
    pub application_id: Option<String>,
    pub application_type: Option<String>,
    pub version: Option<String>,
    pub vendor_id: Option<String>,
    pub vendor: Option<String>,
    pub serial_number: Option<String>,
    pub cardholder_name: Option<String>,
    pub language: Option<String>,
    pub sex: Sex,
    pub url: Option<String>,
    pub login: Option<String>,
    pub forced_signature_pin: bool,
    pub key_attributes: Vec<KeyAttribute>,
    pub max_pin_lengths: PinData<u32>,
    pub pin_retries: PinData<u32>,
    pub signature_count: u64,
    pub kdf: bool,
    pub uif: UifSettings,
    /// Signature, encryption and authentication slots, in that order.
    pub stored_keys: [StoredKey; 3],
}

impl SmartCard {
    /// Parses card status output. Unknown lines are ignored.
    pub fn from_status(status: &str) -> Self {
        let mut lines: HashMap<String, Vec<Option<String>>> = HashMap::new();
        let mut key_attributes = Vec::new();

        for line in status.lines() {
            let mut parts = line.split(':');
            let Some(tag) = parts.next().filter(|t| !t.is_empty()) else {
                continue;
            };
            let fields: Vec<Option<String>> = parts
                .map(|f| (!f.is_empty()).then(|| f.to_string()))
                .collect();

            if tag == "keyattr" {
                let number = |i: usize| fields.get(i).cloned().flatten();
                if let (Some(slot), Some(algorithm)) = (
                    number(0).and_then(|s| s.parse().ok()),
                    number(1).and_then(|a| a.parse().ok()),
                ) {
                    key_attributes.push(KeyAttribute {
                        slot,
                        algorithm,
                        parameter: number(2).unwrap_or_default(),
                    });
                }
                continue;
            }
            lines.insert(tag.to_ascii_lowercase(), fields);
        }
        key_attributes.sort_by_key(|a| a.slot);

        let field = |tag: &str, i: usize| -> Option<String> {
            lines.get(tag).and_then(|f| f.get(i)).cloned().flatten()
        };
        let number = |tag: &str, i: usize| -> u32 {
            field(tag, i).and_then(|v| v.parse().ok()).unwrap_or_default()
        };
        let flag = |tag: &str, i: usize| number(tag, i) != 0;
        let pins = |tag: &str| PinData {
            pin: number(tag, 0),
            reset: number(tag, 1),
            admin: number(tag, 2),
        };

        let cardholder_name = lines.get("name").and_then(|parts| {
            let name = parts.iter().flatten().map(String::as_str).collect::<Vec<_>>().join(" ");
            (!name.is_empty()).then_some(name)
        });

        let stored_keys = std::array::from_fn(|slot| StoredKey {
            fingerprint: field("fpr", slot),
            created: field("fprtime", slot)
                .filter(|t| t != "0")
                .and_then(|t| parse_timestamp(&t)),
            keygrip: field("grp", slot),
        });

        let card = Self {
            reader: field("reader", 0),
            application_id: field("reader", 2),
            application_type: field("reader", 3),
            version: field("version", 0),
            vendor_id: field("vendor", 0),
            vendor: field("vendor", 1),
            serial_number: field("serial", 0),
            cardholder_name,
            language: field("lang", 0),
            sex: Sex::from_gpg(field("sex", 0).as_deref()),
            url: field("url", 0),
            login: field("login", 0),
            forced_signature_pin: flag("forcepin", 0),
            key_attributes,
            max_pin_lengths: pins("maxpinlen"),
            pin_retries: pins("pinretry"),
            signature_count: field("sigcount", 0)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            kdf: field("kdf", 0).as_deref() == Some("on"),
            uif: UifSettings {
                sign: flag("uif", 0),
                decrypt: flag("uif", 1),
                auth: flag("uif", 2),
            },
            stored_keys,
        };
        debug!(serial = ?card.serial_number, reader = ?card.reader, "parsed card status");
        card
    }
}

/// Smartcard operations on a [`Gpg`] context.
#[derive(Debug, Clone, Copy)]
pub struct CardOperator<'a> {
    gpg: &'a Gpg,
}

impl<'a> CardOperator<'a> {
    pub(crate) fn new(gpg: &'a Gpg) -> Self {
        Self { gpg }
    }

    /// Status of the inserted card, or `None` when no card is available.
    pub async fn card_status(&self) -> Result<Option<SmartCard>> {
        let (handle, status) = self
            .gpg
            .run(["--with-colons", "--card-status"], None, SpawnOptions::default())
            .await?;
        if !status.success() {
            debug!(?status, "no card available");
            return Ok(None);
        }
        Ok(Some(SmartCard::from_status(&handle.output_text())))
    }

    /// Opens an interactive `--card-edit` dialogue in admin mode.
    pub async fn edit(&self) -> Result<CardEditor> {
        CardEditor::activate(self.gpg).await
    }
}

/// A running `--card-edit` dialogue with admin commands enabled.
///
/// PINs are answered through the loopback pinentry, so operations that need
/// one take it as an argument.
#[derive(Debug)]
pub struct CardEditor {
    driver: StatusDriver,
}

impl CardEditor {
    pub(crate) async fn activate(gpg: &Gpg) -> Result<Self> {
        let mut args: Vec<String> = ["--pinentry-mode", "loopback"].map(String::from).to_vec();
        args.extend(GNUPG_PROTOCOL_FLAGS.map(String::from));
        args.push("--card-edit".to_string());

        let mut config = DriverConfig::gnupg(CARDEDIT_PROMPT);
        if let Some(timeout) = gpg.config().timeout {
            config = config.turn_timeout(timeout);
        }

        let driver =
            StatusDriver::activate_with(gpg.session(), gpg.command(args), SpawnOptions::default(), config)
                .await?;
        Self::admin(driver).await
    }

    async fn admin(mut driver: StatusDriver) -> Result<Self> {
        driver.execute("admin", &[]).await?;
        Ok(Self { driver })
    }

    pub async fn execute(&mut self, command: &str, answers: &[&str]) -> Result<Transcript> {
        self.driver.execute(command, answers).await
    }

    /// Wipes every key and setting on the card.
    pub async fn factory_reset(&mut self) -> Result<Transcript> {
        expect_success(self.execute("factory-reset", &["y", "yes"]).await?)
    }

    pub async fn set_name(
        &mut self,
        surname: &str,
        given_name: &str,
        admin_pin: &str,
    ) -> Result<Transcript> {
        expect_success(self.execute("name", &[surname, given_name, admin_pin]).await?)
    }

    /// Sets the URL gpg fetches the public key from.
    pub async fn set_url(&mut self, url: &str, admin_pin: &str) -> Result<Transcript> {
        expect_success(self.execute("url", &[url, admin_pin]).await?)
    }

    pub async fn set_login(&mut self, login: &str, admin_pin: &str) -> Result<Transcript> {
        expect_success(self.execute("login", &[login, admin_pin]).await?)
    }

    /// Imports the public key from the card's URL into the keyring.
    pub async fn fetch(&mut self) -> Result<Transcript> {
        expect_success(self.execute("fetch", &[]).await?)
    }

    pub async fn quit(mut self) -> Result<()> {
        self.driver.finish("quit", &[]).await?;
        Ok(())
    }
}
