use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragline_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ragline");
    path
}

fn setup_test_env(embedding: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[store]
backend = "sqlite"
path = "{}/data/ragline.sqlite"

{}

[completion]
provider = "disabled"
"#,
        root.display(),
        embedding
    );

    let config_path = config_dir.join("ragline.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn ollama_env() -> (TempDir, PathBuf) {
    setup_test_env(
        r#"[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 8
url = "http://127.0.0.1:9""#,
    )
}

fn run_ragline(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragline_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RABBITMQ_URL")
        .env_remove("WEAVIATE_URL")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragline binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_store_creates_collection() {
    let (tmp, config) = ollama_env();
    let (stdout, stderr, success) = run_ragline(&config, &["init-store"]);
    assert!(success, "init-store failed: {}", stderr);
    assert!(stdout.contains("Created collection DocumentChunk (8 dims, sqlite backend)"));
    assert!(tmp.path().join("data/ragline.sqlite").exists());
}

#[test]
fn test_init_store_idempotent() {
    let (_tmp, config) = ollama_env();
    let (_, _, success) = run_ragline(&config, &["init-store"]);
    assert!(success);
    let (stdout, stderr, success) = run_ragline(&config, &["init-store"]);
    assert!(success, "second init-store failed: {}", stderr);
    assert!(stdout.contains("Collection DocumentChunk already exists"));
}

#[test]
fn test_init_store_dimension_conflict_fails() {
    let (tmp, config) = ollama_env();
    let (_, _, success) = run_ragline(&config, &["init-store"]);
    assert!(success);

    let changed = fs::read_to_string(&config).unwrap().replace("dims = 8", "dims = 16");
    let other = tmp.path().join("config/changed.toml");
    fs::write(&other, changed).unwrap();

    let (_, stderr, success) = run_ragline(&other, &["init-store"]);
    assert!(!success);
    assert!(stderr.contains("dimension mismatch"), "stderr: {}", stderr);
}

#[test]
fn test_query_empty_needs_no_services() {
    let (_tmp, config) = ollama_env();
    let (stdout, stderr, success) = run_ragline(&config, &["query", ""]);
    assert!(success, "query failed: {}", stderr);
    assert!(stdout.contains("Status: No query"));
    assert!(stdout.contains("No relevant documents found to answer the question."));
}

#[test]
fn test_query_json_output() {
    let (_tmp, config) = ollama_env();
    let (stdout, stderr, success) = run_ragline(&config, &["query", "   ", "--json"]);
    assert!(success, "query failed: {}", stderr);
    let reply: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(reply["embedding_status"], "No query");
    assert_eq!(
        reply["answer"],
        "No relevant documents found to answer the question."
    );
}

#[test]
fn test_query_rejects_zero_top_k() {
    let (_tmp, config) = ollama_env();
    let (_, stderr, success) = run_ragline(&config, &["query", "x", "--top-k", "0"]);
    assert!(!success);
    assert!(stderr.contains("--top-k"));
}

#[test]
fn test_embedding_provider_required() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, success) = run_ragline(&config, &["init-store"]);
    assert!(!success);
    assert!(stderr.contains("embedding provider is required"), "stderr: {}", stderr);
}

#[test]
fn test_broker_url_required() {
    let (_tmp, config) = ollama_env();
    let (_, stderr, success) = run_ragline(
        &config,
        &["publish", "message", "--user-id", "u1", "--text", "hi"],
    );
    assert!(!success);
    assert!(stderr.contains("RABBITMQ_URL"), "stderr: {}", stderr);

    let (_, stderr, success) = run_ragline(&config, &["setup"]);
    assert!(!success);
    assert!(stderr.contains("broker URL not configured"));
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = ollama_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[chunking]\nsize = 10\noverlap = 20\n").unwrap();
    let (_, stderr, success) = run_ragline(&bad, &["init-store"]);
    assert!(!success);
    assert!(stderr.contains("overlap"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_ragline(&missing, &["init-store"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
