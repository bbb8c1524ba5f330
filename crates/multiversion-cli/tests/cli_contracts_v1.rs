#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn mv_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_mv") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/mv");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "multiversion-cli", "--bin", "mv"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build mv binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn mv_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(mv_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }
    command.env_remove("RUST_LOG");

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mv command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_success(output: &Output, label: &str) {
    assert!(
        output.status.success(),
        "{label} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn temp_path(prefix: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}-{}.{extension}", Ulid::new()))
}

fn write_kinds_file() -> PathBuf {
    let path = temp_path("mv-contract-kinds", "json");
    let body = json!({
        "kinds": [
            {
                "kind": {
                    "id": "article",
                    "base_table": "article",
                    "bundle_key": "type",
                    "langcode_key": "langcode",
                    "translatable": true
                },
                "fields": [
                    { "name": "id", "storage_type": "integer" },
                    { "name": "uuid", "storage_type": "uuid" },
                    { "name": "type", "storage_type": "string" },
                    { "name": "langcode", "storage_type": "language" },
                    { "name": "title", "storage_type": "string", "translatable": true }
                ]
            },
            {
                "kind": { "id": "session", "base_table": "session", "local": true },
                "fields": [
                    { "name": "id", "storage_type": "integer" },
                    { "name": "uuid", "storage_type": "uuid" }
                ]
            }
        ]
    });
    if let Err(err) = std::fs::write(&path, body.to_string()) {
        panic!("failed to write kinds file: {err}");
    }
    path
}

fn seed_articles(db_path: &Path, count: usize) {
    let kinds_file = write_kinds_file();
    let install = mv_output(
        db_path,
        &["kinds", "install", "--file", kinds_file.to_str().unwrap_or("")],
    );
    assert_success(&install, "kinds install");
    assert_eq!(
        stdout_json(&install)["installed"],
        json!(["article", "session"])
    );

    for index in 1..=count {
        let values = json!({
            "bundle": "news",
            "langcode": "en",
            "translations": { "en": { "title": format!("Article {index}") } }
        })
        .to_string();
        let output = mv_output(
            db_path,
            &["legacy", "insert", "--kind", "article", "--values-json", &values],
        );
        assert_success(&output, "legacy insert");
        assert_eq!(stdout_json(&output)["id"], json!(index));
    }

    let _ = std::fs::remove_file(&kinds_file);
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(mv_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "kinds",
        "legacy",
        "enable",
        "convert",
        "status",
        "workspace",
        "entity",
        "token",
    ] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn token_compute_output_is_stable() {
    let db_path = temp_path("mv-contract-token", "sqlite3");

    let first = mv_output(&db_path, &["token", "compute", "--entity-id", "7"]);
    assert_success(&first, "token compute");
    let payload = stdout_json(&first);
    assert_eq!(payload["token"], json!("1-9642517c956973d4476f7933fe917eb1"));
    assert_eq!(payload["index"], json!(1));

    let second = mv_output(
        &db_path,
        &[
            "token",
            "compute",
            "--entity-id",
            "7",
            "--previous",
            "1-9642517c956973d4476f7933fe917eb1",
        ],
    );
    assert_success(&second, "chained token compute");
    assert_eq!(
        stdout_json(&second)["token"],
        json!("2-57ce963626a46ae1165a2ac8deb4bb05")
    );

    // The token command never touches the database.
    assert!(!db_path.exists());
}

#[test]
fn enable_converts_supported_kinds_and_reports_skips() {
    let db_path = temp_path("mv-contract-enable", "sqlite3");
    seed_articles(&db_path, 3);

    let enable = mv_output(&db_path, &["enable", "--batch-size", "2"]);
    assert_success(&enable, "enable");
    let report = stdout_json(&enable);
    assert_eq!(report["enabled"], json!(["article"]));
    assert_eq!(report["failed"], json!([]));
    assert_eq!(report["skipped"], json!(["session"]));
    assert_eq!(report["finished"], json!(1.0));

    let status = mv_output(&db_path, &["status"]);
    assert_success(&status, "status");
    let status = stdout_json(&status);
    assert_eq!(status["failed_kinds"], json!([]));
    let article = match status["kinds"]
        .as_array()
        .and_then(|kinds| kinds.iter().find(|kind| kind["kind"] == json!("article")))
    {
        Some(value) => value.clone(),
        None => panic!("status should list the article kind: {status}"),
    };
    assert_eq!(article["versioned"], json!(true));
    assert_eq!(article["enabled"], json!(true));
    assert_eq!(article["rows"], json!(3));
    assert_eq!(article["conversion_in_flight"], json!(false));

    let loaded = mv_output(&db_path, &["entity", "load", "--kind", "article", "--id", "2"]);
    assert_success(&loaded, "entity load");
    let record = stdout_json(&loaded);
    assert_eq!(record["translations"]["en"]["title"], json!("Article 2"));
    let token = record["revision"]["token"].as_str().unwrap_or("");
    assert!(token.starts_with("1-"), "migrated token should start at 1: {token}");
    assert_eq!(token.len(), 34);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn enable_unknown_kind_fails_with_configuration_error() {
    let db_path = temp_path("mv-contract-unknown", "sqlite3");
    seed_articles(&db_path, 1);

    let output = mv_output(&db_path, &["enable", "--kind", "ghost"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("entity kind ghost is not installed"),
        "expected stable configuration error, got stderr={stderr}"
    );

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn workspace_saves_stay_invisible_to_default_queries() {
    let db_path = temp_path("mv-contract-workspace", "sqlite3");
    seed_articles(&db_path, 2);
    assert_success(&mv_output(&db_path, &["enable"]), "enable");

    let created = mv_output(
        &db_path,
        &["workspace", "create", "--id", "stage", "--label", "Stage"],
    );
    assert_success(&created, "workspace create");
    assert_eq!(stdout_json(&created)["id"], json!("stage"));

    let values = json!({
        "bundle": "news",
        "langcode": "en",
        "translations": { "en": { "title": "Draft only" } }
    })
    .to_string();
    let saved = mv_output(
        &db_path,
        &[
            "entity",
            "save",
            "--kind",
            "article",
            "--workspace",
            "stage",
            "--values-json",
            &values,
        ],
    );
    assert_success(&saved, "entity save");
    let saved = stdout_json(&saved);
    assert_eq!(saved["id"], json!(3));
    assert_eq!(saved["revision"]["workspace"], json!("stage"));

    let query = json!({ "kind": "article", "sort": "id" }).to_string();
    let live = mv_output(&db_path, &["entity", "query", "--query-json", &query]);
    assert_success(&live, "live query");
    let live_ids: Vec<Value> = stdout_json(&live)
        .as_array()
        .map(|rows| rows.iter().map(|row| row["id"].clone()).collect())
        .unwrap_or_default();
    assert_eq!(live_ids, vec![json!(1), json!(2)]);

    let staged = mv_output(
        &db_path,
        &["entity", "query", "--workspace", "stage", "--query-json", &query],
    );
    assert_success(&staged, "stage query");
    let staged_ids: Vec<Value> = stdout_json(&staged)
        .as_array()
        .map(|rows| rows.iter().map(|row| row["id"].clone()).collect())
        .unwrap_or_default();
    assert_eq!(staged_ids, vec![json!(1), json!(2), json!(3)]);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn convert_step_writes_checkpoint_until_done() {
    let db_path = temp_path("mv-contract-step", "sqlite3");
    let checkpoint = temp_path("mv-contract-checkpoint", "json");
    seed_articles(&db_path, 5);

    let mut last = Value::Null;
    for _ in 0..12 {
        let output = mv_output(
            &db_path,
            &[
                "convert",
                "step",
                "--checkpoint",
                checkpoint.to_str().unwrap_or(""),
                "--kind",
                "article",
                "--batch-size",
                "2",
            ],
        );
        assert_success(&output, "convert step");
        last = stdout_json(&output);
        if last["done"] == json!(true) {
            break;
        }
    }

    assert_eq!(last["done"], json!(true), "last step report: {last}");
    assert_eq!(last["failed"], json!([]));
    // Language-aware keys are created with the tables, so none is added.
    assert_eq!(last["fixed_keys"], json!([]));

    let body = match std::fs::read_to_string(&checkpoint) {
        Ok(value) => value,
        Err(err) => panic!("failed reading checkpoint: {err}"),
    };
    let progress: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed parsing checkpoint json: {err}"),
    };
    assert_eq!(progress["kinds"][0]["state"], json!("done"));
    assert_eq!(progress["kinds"][0]["processed"], json!(5));

    let _ = std::fs::remove_file(&db_path);
    let _ = std::fs::remove_file(&checkpoint);
}
