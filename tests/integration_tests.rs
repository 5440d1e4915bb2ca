//! Integration tests for the `quorum` binary.
//!
//! Drives the compiled CLI end to end against a fresh repo, with the
//! binary's bundled mock `AgentRegistry` (no real agent process adapter is
//! wired in, see `src/cli.rs`). That registry can't produce a task plan
//! manifest, so a full `run` deterministically fails at the Plan phase —
//! exercised here as the CLI-level error-reporting contract (exit code,
//! checkpoint-backed status) rather than a happy-path completion, which is
//! covered at the library level by `runner.rs`'s own
//! `start_drives_a_workflow_to_completion_single_agent` test using a
//! scripted `MockAgentRegistry`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn quorum() -> Command {
    Command::cargo_bin("quorum").unwrap()
}

fn repo() -> TempDir {
    TempDir::new().unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn help_succeeds() {
        quorum().arg("--help").assert().success();
    }

    #[test]
    fn version_succeeds() {
        quorum().arg("--version").assert().success();
    }

    #[test]
    fn missing_subcommand_fails() {
        quorum().assert().failure();
    }
}

mod list_and_status {
    use super::*;

    #[test]
    fn list_on_fresh_repo_prints_nothing() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout("");
    }

    #[test]
    fn status_of_unknown_workflow_fails() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("status")
            .arg("wf-does-not-exist")
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("wf-does-not-exist"));
    }

    #[test]
    fn resume_of_unknown_workflow_fails() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("resume")
            .arg("wf-does-not-exist")
            .assert()
            .failure()
            .stderr(predicate::str::contains("no state to resume"));
    }
}

mod run_without_a_real_agent {
    use super::*;

    /// The bundled registry can only echo a fixed placeholder string, which
    /// carries the refine/analyze phases (best-effort refine never fails;
    /// a short analysis is valid as-is under the length rule) but can't be
    /// parsed as a task manifest, so the workflow fails cleanly in Plan.
    #[test]
    fn run_fails_at_plan_with_a_parse_error() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("List three primes.")
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("task plan manifest"));
    }

    #[test]
    fn failed_workflow_is_still_recorded_and_listable() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("List three primes.")
            .assert()
            .failure();

        let listing = quorum()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let listing = String::from_utf8(listing).unwrap();
        assert_eq!(listing.lines().count(), 1, "expected exactly one recorded workflow: {listing}");
        assert!(listing.contains("Failed"), "expected Failed status in: {listing}");
        assert!(listing.contains("plan"), "expected current phase 'plan' in: {listing}");
    }

    #[test]
    fn status_after_failed_run_reports_the_same_workflow() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("List three primes.")
            .assert()
            .failure();

        let listing = quorum()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let listing = String::from_utf8(listing).unwrap();
        let workflow_id = listing.split_whitespace().next().unwrap().to_string();

        quorum()
            .current_dir(dir.path())
            .arg("status")
            .arg(&workflow_id)
            .assert()
            .success()
            .stdout(predicate::str::contains(&workflow_id))
            .stdout(predicate::str::contains("Failed"));
    }

    #[test]
    fn empty_prompt_is_rejected_up_front() {
        let dir = repo();
        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("   ")
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("prompt"));

        // Nothing should have been persisted for a validation failure this early.
        quorum()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout("");
    }
}

mod config_loading {
    use super::*;
    use std::fs;

    #[test]
    fn a_quorum_toml_with_moderator_disabled_is_accepted() {
        let dir = repo();
        let quorum_dir = dir.path().join(".quorum");
        fs::create_dir_all(&quorum_dir).unwrap();
        fs::write(
            quorum_dir.join("quorum.toml"),
            "execution_mode = \"single_agent\"\n[moderator]\nenabled = false\n",
        )
        .unwrap();

        // Still fails at Plan (no real agent), but proves the config file
        // parsed and didn't itself cause a startup error.
        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("List three primes.")
            .assert()
            .failure()
            .code(2)
            .stderr(predicate::str::contains("task plan manifest"));
    }

    #[test]
    fn a_malformed_quorum_toml_is_reported_as_an_internal_error() {
        let dir = repo();
        let quorum_dir = dir.path().join(".quorum");
        fs::create_dir_all(&quorum_dir).unwrap();
        fs::write(quorum_dir.join("quorum.toml"), "this is not valid toml ===").unwrap();

        quorum()
            .current_dir(dir.path())
            .arg("run")
            .arg("List three primes.")
            .assert()
            .failure()
            .code(1);
    }
}
