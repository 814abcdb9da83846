use assert_cmd::Command;
use predicates::prelude::*;

fn opsctl() -> Command {
    Command::cargo_bin("opsctl").unwrap()
}

#[test]
fn classify_prefers_critical_over_warning() {
    opsctl()
        .args(["classify", "WARN: disk nearly full, write FAILED"])
        .assert()
        .success()
        .stdout(predicate::eq("critical\n"));
}

#[test]
fn classify_plain_line_is_info() {
    opsctl()
        .args(["classify", "user", "logged", "in"])
        .assert()
        .success()
        .stdout(predicate::eq("info\n"));
}

#[test]
fn schedule_lists_requested_fire_times() {
    opsctl()
        .args(["schedule", "*/15 * * * *", "--count", "3"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^(\d{4}-\d\d-\d\dT\d\d:(00|15|30|45):00Z\n){3}$").unwrap());
}

#[test]
fn schedule_accepts_intervals() {
    opsctl()
        .args(["schedule", "@every 90s", "-n", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Z\n"));
}

#[test]
fn schedule_rejects_garbage() {
    opsctl()
        .args(["schedule", "every other tuesday"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid cron expression"));
}

#[test]
fn config_prints_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "log_level = \"debug\"\n[limiter]\nburst = 7\n").unwrap();

    opsctl()
        .arg("config")
        .arg("--path")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("log_level = \"debug\"").and(predicate::str::contains("burst = 7")));
}
