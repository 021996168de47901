use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;
use warden_core::lbvs::LbvsWriter;
use warden_core::protocol::{AccessType, ControlCode, SetProcessInfoField, UpdateRulesField, UpdateRulesMode};

fn cli() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("warden-cli").unwrap()
}

#[test]
fn help_lists_commands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("file-rules"))
        .stdout(predicate::str::contains("listen"));
}

#[test]
fn start_payload_is_empty() {
    cli()
        .args(["--print-payload", "start"])
        .assert()
        .success()
        .stdout(format!("{} \n", ControlCode::Start.raw()));
}

#[test]
fn file_rules_payload_matches_encoder() {
    let mut w = LbvsWriter::new();
    w.write_u32(UpdateRulesField::Mode, UpdateRulesMode::PushBack.raw());
    w.begin_group(UpdateRulesField::Rule);
    w.write_wstr(UpdateRulesField::RulePath, "c:\\warden").unwrap();
    w.write_u32(UpdateRulesField::RuleValue, AccessType::ReadOnly.raw());
    w.write_bool(UpdateRulesField::RuleRecursive, true);
    let expected = hex::encode(w.finish().unwrap());

    cli()
        .args([
            "--print-payload",
            "file-rules",
            "--mode",
            "push-back",
            "--rule",
            "read-only,recursive:c:\\warden",
        ])
        .assert()
        .success()
        .stdout(format!("{} {expected}\n", ControlCode::UpdateFileRules.raw()));
}

#[test]
fn process_info_payload_matches_encoder() {
    let mut w = LbvsWriter::new();
    w.write_u32(SetProcessInfoField::Pid, 812);
    w.write_bool(SetProcessInfoField::Protected, true);
    let expected = hex::encode(w.finish().unwrap());

    cli()
        .args(["--print-payload", "process-info", "--pid", "812", "--protected", "true"])
        .assert()
        .success()
        .stdout(predicate::str::ends_with(format!("{expected}\n")));
}

#[test]
fn malformed_rule_is_a_usage_error() {
    cli()
        .args(["--print-payload", "file-rules", "--rule", "sometimes:c:\\x"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown access"));
}

#[test]
fn status_has_no_payload() {
    cli()
        .args(["--print-payload", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not send a control payload"));
}

#[test]
fn missing_secret_is_reported() {
    let dir = tempdir().unwrap();
    cli()
        .arg("--secret")
        .arg(dir.path().join("absent.secret"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("read secret"));
}

#[test]
fn unreachable_service_is_reported() {
    let dir = tempdir().unwrap();
    let secret = dir.path().join("ipc.secret");
    fs::write(&secret, "c2VjcmV0").unwrap();
    cli()
        .arg("--secret")
        .arg(&secret)
        .arg("--control-socket")
        .arg(dir.path().join("control.sock"))
        .arg("start")
        .assert()
        .failure()
        .stderr(predicate::str::contains("control socket"));
}
