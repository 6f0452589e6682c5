//! Example: List all keys in the default keyring
//!
//! Run with: cargo run --example list_keys [pattern]

use gpgctl::{Gpg, Key, KeyKind, Validity};

#[tokio::main]
async fn main() -> gpgctl::Result<()> {
    let pattern = std::env::args().nth(1);

    let gpg = Gpg::new();
    println!("gpg {}", gpg.version().await?);

    let keys = gpg
        .keys()
        .list_keys(pattern.as_deref(), KeyKind::Public, false)
        .await?;

    println!("Found {} keys\n", keys.len());

    for key in &keys {
        println!("{}", format_key_output(key, 0));
    }

    Ok(())
}

fn validity_marker(validity: Validity) -> &'static str {
    match validity {
        Validity::Ultimate => "[U]",
        Validity::Full => "[F]",
        Validity::Marginal => "[M]",
        Validity::Never => "[N]",
        Validity::Undefined => "[?]",
        Validity::Unknown => "[-]",
        Validity::Expired => "[E]",
        Validity::Revoked => "[R]",
        _ => "[?]",
    }
}

fn format_key_output(key: &Key, depth: usize) -> String {
    let indent = "    ".repeat(depth);
    let expires = key
        .expires
        .map(|d| format!(" expires {}", d.format("%Y-%m-%d")))
        .unwrap_or_default();

    let mut out = format!(
        "{indent}{} {} {}{}",
        validity_marker(key.validity),
        key.fingerprint.as_deref().unwrap_or(&key.key_id),
        key.key_type,
        expires
    );
    for uid in &key.user_ids {
        out.push_str(&format!("\n{indent}    {} {}", validity_marker(uid.validity), uid.uid));
    }
    for subkey in &key.subkeys {
        out.push('\n');
        out.push_str(&format_key_output(subkey, depth + 1));
    }
    out
}
