use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;
use std::fs;

fn command(temp: &assert_fs::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("modcrane").expect("binary exists");
    cmd.env("HOME", temp.path()).env("XDG_CONFIG_HOME", temp.child("xdg-config").path());
    cmd
}

#[test]
fn config_add_exclude_is_persisted() {
    let temp = assert_fs::TempDir::new().unwrap();

    command(&temp)
        .arg("config")
        .arg("--add-exclude")
        .arg("quay.io/biocontainers/*")
        .assert()
        .success()
        .stdout(predicate::str::contains("Added exclude pattern"));

    let config_path = temp.child("xdg-config/modcrane/config.toml");
    let contents = fs::read_to_string(config_path.path()).unwrap();
    assert!(contents.contains("quay.io/biocontainers/*"));

    // Adding the same pattern twice keeps a single entry.
    command(&temp)
        .arg("config")
        .arg("--add-exclude")
        .arg("quay.io/biocontainers/*")
        .assert()
        .success();
    let contents = fs::read_to_string(config_path.path()).unwrap();
    assert_eq!(contents.matches("quay.io/biocontainers/*").count(), 1);
}

#[test]
fn alias_cfg_prints_path() {
    let temp = assert_fs::TempDir::new().unwrap();
    command(&temp)
        .arg("cfg")
        .arg("--path")
        .assert()
        .success()
        .stdout(predicate::str::contains("modcrane/config.toml"));
}

#[test]
fn bare_config_shows_effective_settings() {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("xdg-config/modcrane/config.toml").write_str("threads = 3\n").unwrap();
    command(&temp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("threads = 3"))
        .stdout(predicate::str::contains("percentile = 25.0"));
}

#[test]
fn malformed_config_is_reported() {
    let temp = assert_fs::TempDir::new().unwrap();
    temp.child("xdg-config/modcrane/config.toml").write_str("threads = \"many\"\n").unwrap();
    command(&temp)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse configuration"));
}
