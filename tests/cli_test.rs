use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

const CONFIG: &str = r#"
[store_a]
uri = "mongodb://127.0.0.1:1/?connectTimeoutMS=500"
database = "fleet"

[store_b]
url = "postgresql://app@127.0.0.1:1/fleet"

[engine]
call_timeout_secs = 1

[[entity]]
entity_type = "motos"
store_a_collection = "motos"
store_b_table = "motos"
"#;

fn run(home: &Path, config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dual-replicator"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("HOME", home)
        .env_remove("DUAL_REPLICATOR_KEY")
        .env_remove("DUAL_REPLICATOR_CONFIG")
        .output()
        .expect("Failed to execute command")
}

#[test]
fn test_keygen_prints_a_base64_key() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("config.toml");
    let output = run(temp_dir.path(), &config, &["keygen"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    // 32 bytes in standard base64
    assert_eq!(stdout.trim().len(), 44);
}

#[test]
fn test_offline_enqueue_then_stats_and_history() {
    let temp_dir = tempdir().unwrap();
    let home_dir = temp_dir.path();
    let config = home_dir.join("config.toml");
    fs::write(&config, CONFIG).unwrap();

    // Fresh queue
    let output = run(home_dir, &config, &["stats"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("total:   0"));

    // Stores are unreachable, the write is only queued
    let output = run(
        home_dir,
        &config,
        &["enqueue", "motos", r#"{"id":"m1","plate":"X"}"#, "--offline"],
    );
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("motos_m1 pending"));
    assert!(home_dir.join(".dual-replicator").join("queue.db").exists());

    let output = run(home_dir, &config, &["stats", "--entity", "motos"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pending: 1"));

    let output = run(home_dir, &config, &["history"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("motos_m1"));
    assert!(stdout.contains("pending"));

    // Nothing is synced yet, so nothing is purged
    let output = run(home_dir, &config, &["purge", "--older-than-days", "0"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Purged 0 synced records"));
}

#[test]
fn test_enqueue_rejects_invalid_json() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(&config, CONFIG).unwrap();

    let output = run(temp_dir.path(), &config, &["enqueue", "motos", "{not json"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Record is not valid JSON"));
}

#[test]
fn test_stats_rejects_unknown_entity_type() {
    let temp_dir = tempdir().unwrap();
    let config = temp_dir.path().join("config.toml");
    fs::write(&config, CONFIG).unwrap();

    let output = run(temp_dir.path(), &config, &["stats", "--entity", "boats"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown entity type 'boats'"));
    assert!(String::from_utf8_lossy(&output.stdout).is_empty());
}
