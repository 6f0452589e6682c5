//! Interactive key editing through `gpg --edit-key`.

use std::process::ExitStatus;

use tracing::debug;

use crate::error::{Error, Result};
use crate::interactive::{DriverConfig, GNUPG_PROTOCOL_FLAGS, StatusDriver, Transcript};
use crate::keyring::Gpg;
use crate::session::SpawnOptions;
use crate::validation::{validate_keyid, validate_user_id_part};

const KEYEDIT_PROMPT: &str = "keyedit.prompt";

/// Status keywords gpg uses to report a failed edit step.
const FAILURE_STATUS: [&str; 4] = ["BAD_PASSPHRASE", "ERROR", "FAILURE", "KEYEDIT_FAILED"];

/// Maps a transcript reporting a failure to an error.
pub(crate) fn expect_success(transcript: Transcript) -> Result<Transcript> {
    if FAILURE_STATUS.iter().any(|s| transcript.has_status(s)) {
        return Err(Error::UnexpectedOutput(transcript.text()));
    }
    Ok(transcript)
}

/// Reason codes offered when revoking a user ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationReason {
    #[default]
    NoReason,
    /// The user ID is no longer valid.
    NoLongerValid,
}

impl RevocationReason {
    fn code(self) -> &'static str {
        match self {
            Self::NoReason => "0",
            Self::NoLongerValid => "4",
        }
    }
}

/// A running `--edit-key` dialogue on one key.
///
/// Commands are sent one at a time; each returns the transcript gpg printed
/// before prompting again. Changes only reach the keyring through
/// [`save`](Self::save). Dropping the editor kills gpg, discarding them.
///
/// # Example
///
/// ```no_run
/// # async fn example(key: gpgctl::Key) -> gpgctl::Result<()> {
/// use gpgctl::Gpg;
///
/// let gpg = Gpg::new();
/// let mut editor = gpg.keys().edit(&key).await?;
/// editor.add_user_id("Alice", Some("alice@example.org"), None, Some("passphrase")).await?;
/// editor.save().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct KeyEditor {
    driver: StatusDriver,
    fingerprint: String,
}

impl KeyEditor {
    pub(crate) async fn activate(gpg: &Gpg, fingerprint: &str) -> Result<Self> {
        let fingerprint = validate_keyid(fingerprint)?;
        let mut args: Vec<String> = ["--expert", "--pinentry-mode", "loopback"]
            .map(String::from)
            .to_vec();
        args.extend(GNUPG_PROTOCOL_FLAGS.map(String::from));
        args.extend(["--edit-key".to_string(), fingerprint.clone()]);

        let mut config = DriverConfig::gnupg(KEYEDIT_PROMPT);
        if let Some(timeout) = gpg.config().timeout {
            config = config.turn_timeout(timeout);
        }

        debug!(%fingerprint, "starting key editor");
        let driver = StatusDriver::activate_with(
            gpg.session(),
            gpg.command(args),
            SpawnOptions::default(),
            config,
        )
        .await?;
        Ok(Self {
            driver,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Sends a raw edit command with answers to its follow-up questions.
    pub async fn execute(&mut self, command: &str, answers: &[&str]) -> Result<Transcript> {
        self.driver.execute(command, answers).await
    }

    /// Toggles selection of the user ID at `index` (1-based, as gpg numbers
    /// them). `0` clears the selection.
    pub async fn select_user_id(&mut self, index: usize) -> Result<Transcript> {
        self.execute(&format!("uid {index}"), &[]).await
    }

    /// Adds a user ID, answering gpg's name, email and comment questions.
    /// `passphrase` unlocks the key if it is protected.
    pub async fn add_user_id(
        &mut self,
        name: &str,
        email: Option<&str>,
        comment: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<Transcript> {
        let name = validate_user_id_part("name", name)?;
        let email = validate_user_id_part("email", email.unwrap_or_default())?;
        let comment = validate_user_id_part("comment", comment.unwrap_or_default())?;

        let mut answers = vec![name, email, comment];
        answers.extend(passphrase);
        expect_success(self.execute("adduid", &answers).await?)
    }

    /// Revokes the user ID at `index` (1-based).
    pub async fn revoke_user_id(
        &mut self,
        index: usize,
        reason: RevocationReason,
        description: &str,
        passphrase: Option<&str>,
    ) -> Result<Transcript> {
        self.select_user_id(index).await?;

        // Confirm, pick the reason, one description line, end of
        // description, confirm again.
        let mut answers = vec!["y", reason.code()];
        if !description.is_empty() {
            answers.push(description);
        }
        answers.extend(["", "y"]);
        answers.extend(passphrase);
        let transcript = expect_success(self.execute("revuid", &answers).await?)?;

        self.select_user_id(0).await?;
        Ok(transcript)
    }

    /// Changes the passphrase protecting the secret key.
    pub async fn change_passphrase(&mut self, current: &str, new: &str) -> Result<Transcript> {
        expect_success(self.execute("passwd", &[current, new]).await?)
    }

    /// Writes all changes to the keyring and ends the dialogue.
    pub async fn save(mut self) -> Result<ExitStatus> {
        let (transcript, status) = self.driver.finish("save", &[]).await?;
        if !status.success() {
            return Err(Error::Gpg {
                status: status.code().unwrap_or(-1),
                output: transcript.text(),
            });
        }
        Ok(status)
    }

    /// Ends the dialogue, discarding unsaved changes.
    pub async fn quit(mut self) -> Result<ExitStatus> {
        // gpg asks whether to save when there are pending changes.
        let (_, status) = self.driver.finish("quit", &["n"]).await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interactive::GNUPG_STATUS;
    use crate::keyring::GpgConfig;

    /// A stand-in for gpg that prompts like `--edit-key` and echoes what it
    /// reads.
    const FAKE_GPG: &str = r#"
echo "[GNUPG:] KEY_CONSIDERED $1 0"
echo "[GNUPG:] GET_LINE keyedit.prompt"
while read cmd; do
    case "$cmd" in
        save) echo "saved"; exit 0 ;;
        quit) read answer; exit 0 ;;
        adduid)
            read name; read email; read comment
            echo "[GNUPG:] GOT_IT"
            echo "uid $name|$email|$comment"
            ;;
        passwd)
            read old; read new
            if [ "$old" = wrong ]; then echo "[GNUPG:] BAD_PASSPHRASE $1"; fi
            ;;
        *) echo "did $cmd" ;;
    esac
    echo "[GNUPG:] GET_LINE keyedit.prompt"
done
"#;

    async fn fake_editor(gpg: &Gpg) -> KeyEditor {
        let driver = StatusDriver::activate(
            gpg.session(),
            ["sh", "-c", FAKE_GPG, "gpg", "ABCDEF0123456789"],
            DriverConfig::gnupg(KEYEDIT_PROMPT),
        )
        .await
        .unwrap();
        KeyEditor {
            driver,
            fingerprint: "ABCDEF0123456789".to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_user_id_answers_questions() {
        let gpg = Gpg::new();
        let mut editor = fake_editor(&gpg).await;
        let transcript = editor
            .add_user_id("Alice", Some("alice@example.org"), None, None)
            .await
            .unwrap();
        assert_eq!(transcript.lines(), ["uid Alice|alice@example.org|"]);

        let status = editor.save().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_select_user_id() {
        let gpg = Gpg::new();
        let mut editor = fake_editor(&gpg).await;
        let transcript = editor.select_user_id(2).await.unwrap();
        assert_eq!(transcript.text(), "did uid 2");
        editor.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_passphrase_is_an_error() {
        let gpg = Gpg::new();
        let mut editor = fake_editor(&gpg).await;
        let err = editor.change_passphrase("wrong", "new").await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedOutput(_)));

        editor.change_passphrase("right", "new").await.unwrap();
    }

    #[tokio::test]
    async fn test_user_id_parts_are_validated() {
        let gpg = Gpg::new();
        let mut editor = fake_editor(&gpg).await;
        let err = editor
            .add_user_id("Alice <a@example.org>", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { what: "name", .. }));
    }

    #[tokio::test]
    async fn test_activate_rejects_bad_fingerprint() {
        let gpg = Gpg::with_config(GpgConfig::default().program("/nonexistent/gpg"));
        let err = KeyEditor::activate(&gpg, "not-a-key").await.unwrap_err();
        assert!(matches!(err, Error::InvalidKeyId { .. }));
    }

    #[test]
    fn test_expect_success() {
        let ok = Transcript::new(vec!["[GNUPG:] GOOD_PASSPHRASE".to_string()], GNUPG_STATUS);
        assert!(expect_success(ok).is_ok());

        let failed = Transcript::new(
            vec!["[GNUPG:] ERROR keyedit.addsubkey 1".to_string()],
            GNUPG_STATUS,
        );
        assert!(expect_success(failed).is_err());
    }
}
