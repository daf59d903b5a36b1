use std::{fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

const PROG_NAME: &str = "pkcs11";

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin(PROG_NAME).unwrap();
    for var in [
        "PKCS11_CLI_CONF",
        "PKCS11_MODULE_PATH",
        "PKCS11_PIN",
        "PKCS11_RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_the_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("list-tokens"))
        .stdout(predicate::str::contains("list-keys"))
        .stdout(predicate::str::contains("sign"));
}

#[test]
fn test_usage_errors() {
    cmd().assert().failure().code(2);
    cmd().args(["sign", "--token", "0"]).assert().code(2);
    cmd()
        .args(["--mechanism", "md5-rsa", "list-tokens"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown mechanism"));
    cmd()
        .args(["list-keys", "--token", "slot:x"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_module() {
    cmd()
        .arg("list-tokens")
        .assert()
        .code(8)
        .stderr(predicate::str::contains("no PKCS#11 module"));
}

#[test]
fn test_module_cannot_be_loaded() {
    let dir = TempDir::new().unwrap();
    cmd()
        .arg("--module")
        .arg(dir.path().join("libmissing.so"))
        .arg("list-tokens")
        .assert()
        .code(7)
        .stderr(predicate::str::starts_with("ERROR:"));
}

#[test]
fn test_configuration_file() {
    let dir = TempDir::new().unwrap();
    let conf = dir.path().join("pkcs11.toml");

    cmd()
        .arg("--conf")
        .arg(&conf)
        .arg("list-tokens")
        .assert()
        .code(8);

    fs::write(&conf, "module_path = 12\n").unwrap();
    cmd()
        .arg("--conf")
        .arg(&conf)
        .arg("list-tokens")
        .assert()
        .code(8);

    fs::write(
        &conf,
        format!("module_path = {:?}\n", dir.path().join("libmissing.so")),
    )
    .unwrap();
    cmd()
        .env("PKCS11_CLI_CONF", &conf)
        .arg("list-tokens")
        .assert()
        .code(7);
}
