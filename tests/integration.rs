use std::time::{Duration, Instant};

use gpgctl::{
    CleanupPolicy, DriverConfig, Error, ExportOptions, Gpg, GpgConfig, KeyGenParams, KeyKind,
    KeyRole, KeyUsage, ProcessSession, RecordKind, SessionConfig, SpawnOptions, StatusDriver,
    SubkeyParams, build_key_forest, format_user_id, parse_keys, parse_listing, parse_record,
};

const SCRIPTED_CHILD: &str = r#"
echo "STATUS PROMPT-A"
read cmd
if [ "$cmd" = go ]; then
    echo "working on it"
    echo "done"
    echo "STATUS PROMPT-B"
fi
"#;

#[tokio::test]
async fn test_scripted_dialogue() {
    let session = ProcessSession::default();
    let mut driver = StatusDriver::activate(
        &session,
        ["sh", "-c", SCRIPTED_CHILD],
        DriverConfig::new("STATUS", "PROMPT"),
    )
    .await
    .expect("child should prompt");

    let transcript = driver.execute("go", &[]).await.expect("turn should complete");
    assert_eq!(transcript.lines(), ["working on it", "done"]);

    let result = driver.execute("go", &[]).await;
    assert!(matches!(result, Err(Error::ProtocolViolation { .. })));
}

#[tokio::test]
async fn test_wait_timeout_kills_sleeping_process() {
    let session = ProcessSession::default();
    let handle = session
        .spawn("sleep 5", SpawnOptions::default())
        .expect("sleep should spawn");

    let started = Instant::now();
    let result = handle.wait(Some(Duration::from_millis(10))).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(handle.poll().is_some(), "process should have been killed");
}

#[tokio::test]
async fn test_concurrent_cursors_see_same_output() {
    let session = ProcessSession::default();
    let handle = session
        .spawn(
            ["sh", "-c", "for i in 1 2 3; do echo line$i; sleep 0.05; done"],
            SpawnOptions::default(),
        )
        .unwrap();

    let mut first = handle.lines();
    let mut second = handle.lines();
    let (a, b) = tokio::join!(first.collect_remaining(), second.collect_remaining());

    assert_eq!(a, ["line1", "line2", "line3"]);
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_scoped_session_waits_for_children() {
    let session = ProcessSession::new(SessionConfig::default().cleanup(CleanupPolicy::Wait));
    let handle = session
        .scoped(async |session| {
            session
                .spawn(["sh", "-c", "sleep 0.1; echo finished"], SpawnOptions::default())
                .unwrap()
        })
        .await;

    assert!(handle.poll().is_some());
    assert_eq!(handle.output_text(), "finished\n");
}

#[tokio::test]
async fn test_missing_executable() {
    let session = ProcessSession::default();
    let result = session.spawn("/nonexistent/tool --flag", SpawnOptions::default());
    assert!(matches!(result, Err(Error::SpawnFailed { .. })));
}

#[test]
fn test_malformed_listing_yields_two_roots() {
    let listing = "\
zzz:this:is:not:a:record:
pub:u:255:22:79BE3E4300411886:1568815794:::u:::scSC:
fpr:::::::::ABAF11C65A2970B130ABE3C479BE3E4300411886:
pub:f:4096:1:F99FFE0FEAE999BD:1409337986:::-:::scSC:
fpr:::::::::6645B0A8C7005E78DB1D7864F99FFE0FEAE999BD:
";
    let parsed = parse_listing(listing);
    assert_eq!(parsed.anomalies.len(), 1);
    assert_eq!(parsed.records.len(), 5);

    let forest = build_key_forest(&parsed.records);
    assert_eq!(forest.len(), 2);
    assert_eq!(parse_keys(listing), forest);
}

#[test]
fn test_forest_node_count_and_idempotence() {
    let listing = "\
pub:u:255:22:AAAAAAAAAAAAAAAA:1000:::u:::scSC:
fpr:::::::::AFPR:
uid:u::::1000::H1::Alice <alice@example.org>::::::::::0:
sig:!::22:AAAAAAAAAAAAAAAA:1000::::Alice <alice@example.org>:13x::AFPR:::10:
sub:u:255:18:BBBBBBBBBBBBBBBB:1100::::::e:
fpr:::::::::BFPR:
sig:!::22:AAAAAAAAAAAAAAAA:1100::::Alice <alice@example.org>:18x::AFPR:::10:
sub:u:255:22:CCCCCCCCCCCCCCCC:1200::::::s:
fpr:::::::::CFPR:
sig:!::22:AAAAAAAAAAAAAAAA:1200::::Alice <alice@example.org>:18x::AFPR:::10:
pub:u:255:22:DDDDDDDDDDDDDDDD:2000:::u:::scSC:
fpr:::::::::DFPR:
";
    let records = parse_listing(listing).records;
    let key_records = records.iter().filter(|r| r.kind().is_key()).count();

    let forest = build_key_forest(&records);
    let nodes: usize = forest.iter().map(|k| k.tree_size()).sum();
    assert_eq!(nodes, key_records);
    assert_eq!(forest, build_key_forest(&records));

    assert_eq!(forest.len(), 2);
    let alice = &forest[0];
    assert_eq!(alice.subkeys.len(), 2);
    assert!(alice.subkeys.iter().all(|k| k.role == KeyRole::Subkey));
    assert_eq!(alice.find("cfpr").map(|k| k.key_id.as_str()), Some("CCCCCCCCCCCCCCCC"));
}

#[test]
fn test_record_fields_match_source_columns() {
    let line = "sig:!::1:F99FFE0FEAE999BD:1409337986::::Arch Linux ARM:13x::6645B0A8C7005E78DB1D7864F99FFE0FEAE999BD:::8:";
    let record = parse_record(line);
    assert_eq!(*record.kind(), RecordKind::Signature);

    for (i, column) in line.split(':').enumerate() {
        let expected = (!column.is_empty()).then_some(column);
        assert_eq!(record.field(i + 1), expected, "field {}", i + 1);
    }
}

#[tokio::test]
async fn test_get_key_rejects_invalid_keyid() {
    let gpg = Gpg::with_homedir("/nonexistent");

    let result = gpg.keys().get_key("", KeyKind::Public).await;
    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));

    let result = gpg.keys().get_key("GHIJKLMN", KeyKind::Public).await;
    assert!(matches!(result, Err(Error::InvalidKeyId { .. })));
}

#[tokio::test]
async fn test_list_keys_rejects_multiline_pattern() {
    let gpg = Gpg::with_homedir("/nonexistent");
    let result = gpg
        .keys()
        .list_keys(Some("alice\n--delete-keys"), KeyKind::Public, true)
        .await;
    assert!(matches!(result, Err(Error::InvalidInput { .. })));
}

fn ephemeral_gpg() -> (tempfile::TempDir, Gpg) {
    let home = tempfile::tempdir().expect("failed to create homedir");
    let gpg = Gpg::with_config(
        GpgConfig::default()
            .homedir(home.path())
            .timeout(Duration::from_secs(60)),
    );
    (home, gpg)
}

#[tokio::test]
#[ignore]
async fn test_version_real() {
    let (_home, gpg) = ephemeral_gpg();
    let version = gpg.version().await.expect("failed to read version");
    assert!(version.starts_with('2'), "unexpected version {version}");
}

#[tokio::test]
#[ignore]
async fn test_key_lifecycle_real() {
    let (_home, gpg) = ephemeral_gpg();
    let keys = gpg.keys();

    let key = keys
        .generate_key(
            &KeyGenParams::new("Test User")
                .email("test@example.org")
                .algorithm("ed25519")
                .usage([KeyUsage::Sign, KeyUsage::Certify]),
        )
        .await
        .expect("failed to generate key");
    let fingerprint = key.fingerprint.clone().expect("key should have fingerprint");
    assert_eq!(fingerprint.len(), 40);
    assert_eq!(key.user_ids[0].email.as_deref(), Some("test@example.org"));

    let key = keys
        .add_subkey(
            &key,
            &SubkeyParams {
                algorithm: Some("cv25519".into()),
                usage: vec![KeyUsage::Encrypt],
                expiration: Some("1y".into()),
            },
            None,
            None,
        )
        .await
        .expect("failed to add subkey");
    assert_eq!(key.subkeys.len(), 1);
    assert!(key.subkeys[0].expires.is_some());

    let uid = format_user_id("Test User", Some("second@example.org"), Some("work")).unwrap();
    let key = keys
        .add_user_id(&key, &uid, None)
        .await
        .expect("failed to add user id");
    assert!(key.user_ids.iter().any(|u| u.uid == uid));

    let armored = keys
        .export(&key, &ExportOptions::default())
        .await
        .expect("failed to export");
    assert!(String::from_utf8_lossy(&armored).starts_with("-----BEGIN PGP PUBLIC KEY BLOCK-----"));

    assert!(!keys.is_protected(&key).await.unwrap());

    let listed = keys.list_keys(Some("nobody@example.org"), KeyKind::Public, true).await;
    assert!(listed.expect("no match should not be an error").is_empty());
}

#[tokio::test]
#[ignore]
async fn test_key_editor_real() {
    let (_home, gpg) = ephemeral_gpg();
    let key = gpg
        .keys()
        .generate_key(&KeyGenParams::new("Editor Test").email("editor@example.org"))
        .await
        .expect("failed to generate key");

    let mut editor = gpg.keys().edit(&key).await.expect("failed to start editor");
    editor
        .add_user_id("Editor Test", Some("added@example.org"), None, None)
        .await
        .expect("adduid failed");
    editor.save().await.expect("save failed");

    let key = gpg.keys().reload(&key).await.expect("key should still exist");
    assert_eq!(key.user_ids.len(), 2);
}
