use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn proto_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("proto");
    path
}

/// Temp root with `config/proto.toml` and a `support` client holding
/// three supported documents and one unsupported file.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let client_dir = root.join("prototypes").join("support");
    let docs = client_dir.join("source_documents");
    fs::create_dir_all(docs.join("guides")).unwrap();
    fs::write(
        client_dir.join("config.json"),
        r#"{"steps": {"search": {"input": ["query", "limit"], "mode": "sync"}}}"#,
    )
    .unwrap();

    fs::write(
        docs.join("alpha.md"),
        "# Rust tooling\n\nCargo builds crates. Cargo manages crates and dependencies.",
    )
    .unwrap();
    fs::write(
        docs.join("guides").join("beta.txt"),
        "Mailbox setup: configure IMAP and SMTP for your mailbox.",
    )
    .unwrap();
    fs::write(
        docs.join("prices.csv"),
        "product,price\nDomain,12\nHosting,30\n",
    )
    .unwrap();
    fs::write(docs.join("notes.xyz"), "not a supported format").unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_content = format!(
        r#"[server]
bind = "127.0.0.1:0"
tasks_dir = "{root}/tasks"

[clients]
root = "{root}/prototypes"

[ingest]
chunk_size = 500
chunk_overlap = 50
workers = 2

[embedding]
provider = "hash"
dims = 1024
"#,
        root = root.display()
    );
    let config_path = config_dir.join("proto.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_proto(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = proto_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("PERSIST_DIRECTORY")
        .env_remove("SOURCE_DIRECTORY")
        .env_remove("TARGET_SOURCE_CHUNKS")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run proto binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_ingest_counts_supported_and_unsupported() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_proto(&config_path, &["ingest", "support"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("3 files discovered, 1 unsupported, 0 unchanged"),
        "stdout={}",
        stdout
    );
    assert!(stdout.contains("failed: 0"), "stdout={}", stdout);
    assert!(stdout.contains("(new index)"), "stdout={}", stdout);
}

#[test]
fn test_ingest_twice_writes_nothing_new() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_proto(&config_path, &["ingest", "support"]);
    assert!(success, "first ingest failed: {}", stderr);

    let (stdout, stderr, success) = run_proto(&config_path, &["ingest", "support"]);
    assert!(success, "second ingest failed: {}", stderr);
    assert!(stdout.contains("3 unchanged"), "stdout={}", stdout);
    assert!(stdout.contains("No new documents to load"), "stdout={}", stdout);
}

#[test]
fn test_ingest_picks_up_changed_file() {
    let (tmp, config_path) = setup_test_env();
    run_proto(&config_path, &["ingest", "support"]);

    let beta = tmp
        .path()
        .join("prototypes/support/source_documents/guides/beta.txt");
    fs::write(&beta, "Mailbox setup changed: use port 993 for IMAP.").unwrap();
    fs::File::options()
        .write(true)
        .open(&beta)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();

    let (stdout, stderr, success) = run_proto(&config_path, &["ingest", "support"]);
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("2 unchanged"), "stdout={}", stdout);
    assert!(stdout.contains("replaced: 1"), "stdout={}", stdout);
}

#[test]
fn test_reset_rebuilds_index() {
    let (_tmp, config_path) = setup_test_env();
    run_proto(&config_path, &["ingest", "support"]);

    let (stdout, stderr, success) = run_proto(&config_path, &["ingest", "support", "--reset"]);
    assert!(success, "reset ingest failed: {}", stderr);
    assert!(stdout.contains("0 unchanged"), "stdout={}", stdout);
    assert!(stdout.contains("(new index)"), "stdout={}", stdout);
}

#[test]
fn test_search_after_ingest() {
    let (_tmp, config_path) = setup_test_env();
    run_proto(&config_path, &["ingest", "support"]);

    let (stdout, stderr, success) = run_proto(
        &config_path,
        &["search", "support", "cargo crates", "--limit", "1"],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.starts_with("1. ["), "stdout={}", stdout);
    assert!(stdout.contains("alpha.md"), "stdout={}", stdout);
    assert!(!stdout.contains("2. ["), "stdout={}", stdout);
}

#[test]
fn test_search_without_index() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_proto(&config_path, &["search", "support", "anything"]);
    assert!(success);
    assert!(stdout.contains("No index for client 'support'"), "stdout={}", stdout);
}

#[test]
fn test_ingest_missing_client_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_proto(&config_path, &["ingest", "nobody"]);
    assert!(!success);
    assert!(stderr.contains("Source directory does not exist"), "stderr={}", stderr);
}

#[test]
fn test_clients_lists_steps() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_proto(&config_path, &["clients"]);
    assert!(success, "clients failed: {}", stderr);
    assert!(stdout.contains("support (workflow: support)"), "stdout={}", stdout);
    assert!(stdout.contains("search [Sync] input: query, limit"), "stdout={}", stdout);
    assert!(
        stdout.contains("Similarity search over the knowledge base"),
        "stdout={}",
        stdout
    );
    assert!(stdout.contains("not exposed: ask, generate"), "stdout={}", stdout);
}

#[test]
fn test_ask_without_index() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_proto(&config_path, &["ask", "support", "anything?"]);
    assert!(success);
    assert!(stdout.contains("No index for client 'support'"), "stdout={}", stdout);
}

#[test]
fn test_prepare_writes_sidecar_then_ingests() {
    let (tmp, config_path) = setup_test_env();
    let client_dir = tmp.path().join("prototypes/support");
    let originals = client_dir.join("original_documents");
    fs::create_dir_all(&originals).unwrap();
    fs::write(
        originals.join("transfer.md"),
        "---\ntitle: Domain transfer\nslug: domain-transfer\ntags:\n  - domains\n---\nRequest the auth code before a domain transfer.\n",
    )
    .unwrap();
    fs::write(originals.join("_unpublished.md"), "draft").unwrap();

    let (stdout, stderr, success) = run_proto(&config_path, &["prepare", "support"]);
    assert!(success, "prepare failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("Cleaned 1 documents, skipped 1 documents"),
        "stdout={}",
        stdout
    );

    let docs = client_dir.join("source_documents");
    let sidecar: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(docs.join("transfer.json")).unwrap()).unwrap();
    assert_eq!(sidecar["slug"], "domain-transfer");
    assert!(!fs::read_to_string(docs.join("transfer.md"))
        .unwrap()
        .contains("slug:"));

    run_proto(&config_path, &["ingest", "support"]);
    let (stdout, _, _) = run_proto(
        &config_path,
        &["search", "support", "auth code domain transfer", "--limit", "1"],
    );
    assert!(stdout.contains("transfer.md"), "stdout={}", stdout);
}
