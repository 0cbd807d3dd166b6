//! Integration tests for the conductor CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn conductor() -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.env_remove("CONDUCTOR_LOG").env_remove("RUST_LOG");
    cmd
}

fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    conductor()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        conductor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("policies"));
    }

    #[test]
    fn test_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_tracker_kind_rejected() {
        conductor()
            .args(["once", "--tracker", "jira"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Valid values: beads, memory"));
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        conductor()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        assert!(dir.path().join(".conductor/conductor.toml").exists());
        assert!(dir.path().join(".conductor/audit").is_dir());
        assert!(dir.path().join(".conductor/messages").is_dir());
    }

    #[test]
    fn test_init_does_not_overwrite() {
        let dir = init_project();
        let path = dir.path().join(".conductor/conductor.toml");
        fs::write(&path, "default_policy = \"mine\"\n").unwrap();

        conductor()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "default_policy = \"mine\"\n");

        conductor()
            .current_dir(dir.path())
            .args(["init", "--force"])
            .assert()
            .success();
        assert!(fs::read_to_string(&path).unwrap().contains("[[policies]]"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_validate_starter_config() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_validate_without_config_fails() {
        let dir = TempDir::new().unwrap();
        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("conductor init"));
    }

    #[test]
    fn test_validate_rejects_unknown_default_policy() {
        let dir = init_project();
        let path = dir.path().join(".conductor/conductor.toml");
        let content = fs::read_to_string(&path)
            .unwrap()
            .replace("default_policy = \"feature\"", "default_policy = \"missing\"");
        fs::write(&path, content).unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn test_show_uses_explicit_config_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("alt.toml");
        fs::write(
            &file,
            r#"
[labels]
prefix = "bot"

[[policies]]
name = "only"

[[policies.phases]]
name = "work"
"#,
        )
        .unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["config", "show", "--config"])
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("prefix = \"bot\""))
            .stdout(predicate::str::contains("Policies: only"));
    }
}

mod policies {
    use super::*;

    #[test]
    fn test_list_marks_default() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["policies", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("* feature"))
            .stdout(predicate::str::contains("plan -> implement -> test -> review"));
    }

    #[test]
    fn test_show_phase_details() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["policies", "show", "hotfix"])
            .assert()
            .success()
            .stdout(predicate::str::contains("requires human approval"))
            .stdout(predicate::str::contains("always carry a HITL label"));
    }

    #[test]
    fn test_show_unknown_policy() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["policies", "show", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Valid values: feature, bugfix, hotfix"));
    }

    #[test]
    fn test_resolve_by_issue_type() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["policies", "resolve", "--type", "bug"])
            .assert()
            .success()
            .stdout(predicate::str::contains("bugfix"))
            .stdout(predicate::str::contains("starts at phase 'implement'"));
    }

    #[test]
    fn test_resolve_override_label_wins() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args([
                "policies",
                "resolve",
                "--type",
                "bug",
                "--label",
                "conductor-workflow:hotfix",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("hotfix"))
            .stdout(predicate::str::contains("override label"));
    }

    #[test]
    fn test_resolve_unknown_override_errors() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["policies", "resolve", "--label", "conductor-workflow:ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    }

    #[test]
    fn test_resolve_keeps_existing_phase_label() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args([
                "policies",
                "resolve",
                "--type",
                "feature",
                "--label",
                "conductor-phase:test",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("starts at phase 'test'"));
    }
}

mod audit {
    use super::*;

    #[test]
    fn test_empty_audit() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["audit", "runs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded."));
    }

    #[test]
    fn test_decisions_filtered_by_issue() {
        let dir = init_project();
        let log = dir.path().join(".conductor/audit/decisions.jsonl");
        let lines = [
            r#"{"id":"d1","issue_id":"bd-1","timestamp":"2026-01-05T10:00:00Z","type":"policy_resolution","decision":"feature","reasoning":"issue type"}"#,
            r#"{"id":"d2","issue_id":"bd-2","timestamp":"2026-01-05T10:01:00Z","type":"agent_selection","decision":"none","reasoning":"no suitable agent"}"#,
        ];
        fs::write(&log, lines.join("\n") + "\n").unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["audit", "decisions", "--issue", "bd-2"])
            .assert()
            .success()
            .stdout(predicate::str::contains("no suitable agent"))
            .stdout(predicate::str::contains("1 of 1 decisions shown"))
            .stdout(predicate::str::contains("bd-1").not());
    }
}

mod once {
    use super::*;

    #[test]
    fn test_once_with_empty_memory_tracker() {
        let dir = init_project();
        conductor()
            .current_dir(dir.path())
            .args(["once", "--tracker", "memory"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 fetched, 0 processed"));
        assert!(dir.path().join(".conductor/audit/audit.lock").exists());
    }

    #[test]
    fn test_once_refuses_invalid_config() {
        let dir = init_project();
        let path = dir.path().join(".conductor/conductor.toml");
        let content = fs::read_to_string(&path)
            .unwrap()
            .replace("poll_interval_secs = 30", "poll_interval_secs = 0");
        fs::write(&path, content).unwrap();

        conductor()
            .current_dir(dir.path())
            .args(["once", "--tracker", "memory"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration is invalid"));
    }
}
