use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_fsm<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_fsm"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute fsm binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_fsm(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "fsm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_fsm(args);
    assert!(!output.status.success(), "command should fail");
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

fn load_datasets(db: &str, dir: &Path) {
    let tax = dir.join("tax.csv");
    write_file(
        &tax,
        "identifier,surname,date_of_birth\nAB123456C,SMITHSON,1984-03-12\nCD654321A,Khan,1979-11-30\n",
    );
    let loaded = run_json([
        "--db",
        db,
        "dataset",
        "load",
        "--dataset",
        "tax-authority",
        "--file",
        path_str(&tax),
    ]);
    assert_eq!(as_u64(&loaded, "loaded"), 2);

    let immigration = dir.join("immigration.csv");
    write_file(&immigration, "2407/0034/12,Ahmed,1991-06-05\n");
    let loaded = run_json([
        "--db",
        db,
        "dataset",
        "load",
        "--dataset",
        "immigration-support",
        "--file",
        path_str(&immigration),
    ]);
    assert_eq!(as_str(&loaded, "dataset"), "immigration_support");
}

#[test]
fn schema_version_and_migrate_report_contract() {
    let dir = unique_temp_dir("fsm-cli-schema");
    let db = dir.join("fsm.sqlite3");
    let db = path_str(&db);

    let before = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");
    assert_eq!(before["current_version"], 0);
    assert_eq!(before["pending_versions"], serde_json::json!([1, 2]));

    let dry_run = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2]));

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(migrated["after_version"], 2);
    assert_eq!(migrated["up_to_date"], true);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn submit_process_and_resubmit_uses_recent_outcome() {
    let dir = unique_temp_dir("fsm-cli-check");
    let db_path = dir.join("fsm.sqlite3");
    let db = path_str(&db_path);
    load_datasets(db, &dir);

    let submitted = run_json([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "smith",
        "--date-of-birth",
        "1984-03-12",
        "--nino",
        "ab123456c",
    ]);
    assert_eq!(as_str(&submitted, "status"), "queued_for_processing");
    let check_id = as_str(&submitted, "check_id").to_string();
    assert!(as_str(&submitted["links"], "process").ends_with(&check_id));

    let processed = run_json(["--db", db, "check", "process", "--check-id", &check_id]);
    assert_eq!(as_str(&processed, "status"), "eligible");

    let stderr = run_failure(["--db", db, "check", "process", "--check-id", &check_id]);
    assert!(stderr.contains("queued_for_processing"), "unexpected stderr: {stderr}");

    let resubmitted = run_json([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "SMITH",
        "--date-of-birth",
        "1984-03-12",
        "--nino",
        "AB123456C",
    ]);
    assert_eq!(as_str(&resubmitted, "status"), "eligible");
    assert_ne!(as_str(&resubmitted, "check_id"), check_id);

    let status = run_json(["--db", db, "check", "status", "--check-id", &check_id]);
    assert_eq!(as_str(&status, "status"), "eligible");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unmatched_nino_without_benefits_client_stays_queued() {
    let dir = unique_temp_dir("fsm-cli-source-error");
    let db_path = dir.join("fsm.sqlite3");
    let db = path_str(&db_path);

    let submitted = run_json([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "Jones",
        "--date-of-birth",
        "1975-01-01",
        "--nino",
        "ZZ999999Z",
    ]);
    let check_id = as_str(&submitted, "check_id").to_string();

    let processed = run_json(["--db", db, "check", "process", "--check-id", &check_id]);
    assert_eq!(as_str(&processed, "status"), "source_error");

    let status = run_json(["--db", db, "check", "status", "--check-id", &check_id]);
    assert_eq!(as_str(&status, "status"), "queued_for_processing");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn bulk_submit_drain_and_results_follow_submission_order() {
    let dir = unique_temp_dir("fsm-cli-bulk");
    let db_path = dir.join("fsm.sqlite3");
    let db = path_str(&db_path);
    load_datasets(db, &dir);

    let batch = dir.join("batch.json");
    write_file(
        &batch,
        r#"[
          {"surname": "Begum", "date_of_birth": "1988-02-02", "asylum_support_reference": "9999/0000/01"},
          {"surname": "Khan", "date_of_birth": "1979-11-30", "national_insurance_number": "cd654321a"},
          {"surname": "Ahmed", "date_of_birth": "1991-06-05", "asylum_support_reference": "2407/0034/12"}
        ]"#,
    );
    let submitted = run_json([
        "--db",
        db,
        "bulk",
        "submit",
        "--file",
        path_str(&batch),
        "--group-id",
        "spring-intake",
    ]);
    assert_eq!(as_str(&submitted, "group_id"), "spring-intake");
    let submitted_ids = submitted["checks"]
        .as_array()
        .unwrap_or_else(|| panic!("checks should be an array: {submitted}"))
        .iter()
        .map(|receipt| as_str(receipt, "check_id").to_string())
        .collect::<Vec<_>>();
    assert_eq!(submitted_ids.len(), 3);

    let progress = run_json(["--db", db, "bulk", "status", "--group-id", "spring-intake"]);
    assert_eq!(as_u64(&progress, "total"), 3);
    assert_eq!(as_u64(&progress, "complete"), 0);

    let drained =
        run_json(["--db", db, "worker", "drain", "--destination", "bulk", "--limit", "10"]);
    assert_eq!(as_u64(&drained["report"], "resolved"), 3);
    assert_eq!(as_u64(&drained, "remaining"), 0);

    let progress = run_json(["--db", db, "bulk", "status", "--group-id", "spring-intake"]);
    assert_eq!(as_u64(&progress, "complete"), 3);
    assert_eq!(progress["finished"], true);

    let results = run_json(["--db", db, "bulk", "results", "--group-id", "spring-intake"]);
    let rows = results["results"]
        .as_array()
        .unwrap_or_else(|| panic!("results should be an array: {results}"));
    let ids = rows.iter().map(|row| as_str(row, "check_id").to_string()).collect::<Vec<_>>();
    assert_eq!(ids, submitted_ids);
    let statuses = rows.iter().map(|row| as_str(row, "status")).collect::<Vec<_>>();
    assert_eq!(statuses, vec!["parent_not_found", "eligible", "eligible"]);
    assert_eq!(rows[1]["sequence"], 2);

    let missing = run_failure(["--db", db, "bulk", "status", "--group-id", "unknown"]);
    assert!(missing.contains("not found"), "unexpected stderr: {missing}");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn override_is_recorded_in_the_audit_trail() {
    let dir = unique_temp_dir("fsm-cli-override");
    let db_path = dir.join("fsm.sqlite3");
    let db = path_str(&db_path);

    let submitted = run_json([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "Nowak",
        "--date-of-birth",
        "1982-09-09",
        "--asylum-reference",
        "1111/2222/33",
        "--actor",
        "school-office",
    ]);
    let check_id = as_str(&submitted, "check_id").to_string();

    let overridden = run_json([
        "--db",
        db,
        "check",
        "override",
        "--check-id",
        &check_id,
        "--status",
        "eligible",
        "--actor",
        "caseworker",
        "--reason",
        "paper evidence",
    ]);
    assert_eq!(as_str(&overridden["check"], "status"), "eligible");

    let shown = run_json(["--db", db, "check", "show", "--check-id", &check_id, "--audit"]);
    let actions = shown["audit"]
        .as_array()
        .unwrap_or_else(|| panic!("audit should be an array: {shown}"))
        .iter()
        .map(|entry| as_str(entry, "action").to_string())
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["submitted".to_string(), "status_overridden".to_string()]);
    assert_eq!(shown["audit"][1]["detail"]["reason"], "paper evidence");
    assert_eq!(shown["check"]["payload"]["identity"]["surname"], "NOWAK");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn invalid_inputs_fail_without_json_output() {
    let dir = unique_temp_dir("fsm-cli-invalid");
    let db_path = dir.join("fsm.sqlite3");
    let db = path_str(&db_path);

    let stderr = run_failure([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "Smith",
        "--date-of-birth",
        "1984-03-12",
    ]);
    assert!(stderr.contains("MUST be provided"), "unexpected stderr: {stderr}");

    let stderr = run_failure(["--db", db, "check", "status", "--check-id", "not-a-ulid"]);
    assert!(stderr.contains("invalid check id"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db",
        db,
        "check",
        "submit",
        "--surname",
        "Smith",
        "--date-of-birth",
        "1984-3-12",
        "--nino",
        "AB123456C",
    ]);
    assert!(stderr.contains("YYYY-MM-DD"), "unexpected stderr: {stderr}");

    let stderr = run_failure([
        "--db",
        db,
        "check",
        "override",
        "--check-id",
        "01J00000000000000000000000",
        "--status",
        "source-error",
        "--actor",
        "caseworker",
    ]);
    assert!(stderr.contains("source-error"), "unexpected stderr: {stderr}");

    let config = dir.join("engine.yaml");
    write_file(
        &config,
        "universal_credit_thresholds:\n  one_period: '900'\n  two_periods: '800'\n  three_periods: '1000'\n",
    );
    let stderr = run_failure([
        "--db",
        db,
        "--config",
        path_str(&config),
        "bulk",
        "status",
        "--group-id",
        "any",
    ]);
    assert!(stderr.contains("config"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&dir);
}
