use crate::error::{Error, Result};

/// Checks that `keyid` names a key unambiguously enough to hand to gpg and
/// returns it uppercased, without any `0x` prefix.
///
/// Accepts short (8) and long (16) key IDs and v4 (40) or v5 (64) hex
/// fingerprints.
pub fn validate_keyid(keyid: &str) -> Result<String> {
    let invalid = |reason: String| Error::InvalidKeyId {
        keyid: keyid.to_string(),
        reason,
    };

    let hex = ["0x", "0X"]
        .iter()
        .find_map(|prefix| keyid.strip_prefix(prefix))
        .unwrap_or(keyid);
    if hex.is_empty() {
        return Err(invalid("key ID cannot be empty".to_string()));
    }
    if let Some(c) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(invalid(format!("unexpected character {c:?}")));
    }

    match hex.len() {
        8 | 16 | 40 | 64 => Ok(hex.to_ascii_uppercase()),
        len => Err(invalid(format!(
            "expected 8, 16, 40 or 64 hex characters, got {len}"
        ))),
    }
}

/// Validates one line destined for gpg's command fd.
///
/// gpg reads one answer per line, so an embedded line break would be taken
/// as a second answer to whatever it asks next.
pub fn validate_protocol_line(line: &str) -> Result<&str> {
    reject_line_breaks("protocol line", line)
}

/// Validates a passphrase passed through `--passphrase-fd`.
///
/// gpg stops reading at the first newline, so anything after it would be
/// silently dropped.
pub fn validate_passphrase(passphrase: &str) -> Result<&str> {
    reject_line_breaks("passphrase", passphrase)
}

/// Validates a user ID part (name, email or comment) for key generation and
/// interactive user ID creation.
pub fn validate_user_id_part<'a>(what: &'static str, value: &'a str) -> Result<&'a str> {
    reject_line_breaks(what, value)?;
    if value.contains(['<', '>']) {
        return Err(Error::InvalidInput {
            what,
            reason: "must not contain '<' or '>'".to_string(),
        });
    }
    Ok(value)
}

/// Validates an expiration as understood by gpg: `0`/`never`/`none`, a count with an
/// optional `d`/`w`/`m`/`y` unit, `seconds=N`, or an ISO date.
pub fn validate_expiration(expiration: &str) -> Result<&str> {
    let invalid = |reason: &str| Error::InvalidInput {
        what: "expiration",
        reason: reason.to_string(),
    };

    if expiration.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if matches!(expiration, "never" | "none") {
        return Ok(expiration);
    }
    if let Some(seconds) = expiration.strip_prefix("seconds=") {
        return if !seconds.is_empty() && seconds.chars().all(|c| c.is_ascii_digit()) {
            Ok(expiration)
        } else {
            Err(invalid("seconds= must be followed by a number"))
        };
    }

    let digits = expiration.trim_end_matches(['d', 'w', 'm', 'y']);
    let unit_len = expiration.len() - digits.len();
    if !digits.is_empty() && unit_len <= 1 && digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(expiration);
    }

    let is_date = expiration.len() == 10
        && expiration
            .char_indices()
            .all(|(i, c)| if i == 4 || i == 7 { c == '-' } else { c.is_ascii_digit() });
    let is_compact_timestamp = expiration.len() == 15
        && expiration
            .char_indices()
            .all(|(i, c)| if i == 8 { c == 'T' } else { c.is_ascii_digit() });
    if is_date || is_compact_timestamp {
        return Ok(expiration);
    }

    Err(invalid("expected 0, a duration such as 2y, seconds=N or an ISO date"))
}

fn reject_line_breaks<'a>(what: &'static str, value: &'a str) -> Result<&'a str> {
    if value.contains(['\n', '\r']) {
        return Err(Error::InvalidInput {
            what,
            reason: "must not contain line breaks".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyid_normalized() {
        for (input, expected) in [
            ("deadbeef", "DEADBEEF"),
            ("0XDEADBEEF", "DEADBEEF"),
            ("0x786c63f330d7cb92", "786C63F330D7CB92"),
            (
                "ABAF11C65A2970B130ABE3C479BE3E4300411886",
                "ABAF11C65A2970B130ABE3C479BE3E4300411886",
            ),
        ] {
            assert_eq!(validate_keyid(input).unwrap(), expected);
        }
        assert_eq!(validate_keyid(&"a".repeat(64)).unwrap().len(), 64);
    }

    #[test]
    fn test_keyid_rejected() {
        let md5_fingerprint = "A".repeat(32);
        for bad in [
            "",
            "0x",
            "DEADBE",
            "DEADBEEG",
            "DEAD BEEF",
            "ALICE",
            "-DEADBEEF",
            md5_fingerprint.as_str(),
        ] {
            let err = validate_keyid(bad).unwrap_err();
            assert!(matches!(err, Error::InvalidKeyId { .. }), "{bad}");
        }
    }

    #[test]
    fn test_protocol_line() {
        assert_eq!(validate_protocol_line("adduid").unwrap(), "adduid");
        assert_eq!(validate_protocol_line("").unwrap(), "");

        for bad in ["y\nsave", "quit\r", "\n"] {
            let err = validate_protocol_line(bad).unwrap_err();
            assert!(matches!(
                err,
                Error::InvalidInput { what: "protocol line", .. }
            ));
        }
    }

    #[test]
    fn test_passphrase() {
        assert!(validate_passphrase("correct horse: battery staple").is_ok());
        assert!(validate_passphrase("two\nlines").is_err());
    }

    #[test]
    fn test_user_id_part() {
        assert!(validate_user_id_part("name", "Alice Example").is_ok());
        assert!(validate_user_id_part("name", "Alice <alice@example.org>").is_err());
        assert!(validate_user_id_part("comment", "work\nsave").is_err());
    }

    #[test]
    fn test_expiration() {
        for ok in ["0", "never", "none", "2y", "14d", "3w", "6m", "seconds=86400", "2030-01-31", "20300131T120000"] {
            assert_eq!(validate_expiration(ok).unwrap(), ok, "{ok}");
        }
        for bad in ["", "y", "2yy", "seconds=", "seconds=x", "2030/01/31", "soon", "1; rm -rf /"] {
            assert!(validate_expiration(bad).is_err(), "{bad}");
        }
    }
}
