//! End-to-end worker cycles against the file-backed audit log and messenger.

use std::sync::Arc;

use conductor::audit::{DecisionType, JsonlRunLog, RunStatus};
use conductor::conductor_config::{ConductorToml, DEFAULT_CONFIG};
use conductor::executor::{ScriptedPlatform, ScriptedReply};
use conductor::messenger::FileMessenger;
use conductor::tracker::{Issue, IssueStatus, MemoryTracker};
use conductor::worker::{IssueReport, Ports, WorkerLoop};
use tempfile::TempDir;

struct Engine {
    dir: TempDir,
    tracker: Arc<MemoryTracker>,
    platform: Arc<ScriptedPlatform>,
    worker: WorkerLoop,
}

fn engine(issues: Vec<Issue>) -> Engine {
    let dir = TempDir::new().unwrap();
    let toml = ConductorToml::parse(DEFAULT_CONFIG).unwrap();
    let tracker = Arc::new(MemoryTracker::with_issues(issues));
    let platform = Arc::new(ScriptedPlatform::new());
    let ports = Ports {
        tracker: tracker.clone(),
        registry: Arc::new(toml.registry()),
        platform: platform.clone(),
        run_log: Arc::new(JsonlRunLog::open(&dir.path().join("audit")).unwrap()),
        messenger: Arc::new(FileMessenger::new(dir.path().join("messages"))),
    };
    let worker = WorkerLoop::new(toml.build_store().unwrap(), toml.resolver(), ports)
        .with_config(toml.worker.clone())
        .with_hitl(toml.hitl_policy().unwrap())
        .with_assistant(toml.worker_assistant.clone())
        .with_session(toml.session.clone())
        .with_templates(toml.templates.clone());
    Engine {
        dir,
        tracker,
        platform,
        worker,
    }
}

#[tokio::test]
async fn test_bug_runs_to_closure_with_persisted_audit() {
    let e = engine(vec![Issue::new("bd-7", "Crash on empty query").with_type("bug")]);

    let first = e.worker.run_cycle(None).await.unwrap();
    assert_eq!(first.processed.len(), 1);
    let second = e.worker.run_cycle(None).await.unwrap();
    match &second.processed[0].1 {
        IssueReport::Transitioned { phase, next_phase, .. } => {
            assert_eq!(phase, "test");
            assert!(next_phase.is_none());
        }
        other => panic!("unexpected report: {:?}", other),
    }

    let issue = e.tracker.snapshot("bd-7").unwrap();
    assert_eq!(issue.status, IssueStatus::Closed);
    assert!(!issue.labels.iter().any(|l| l.starts_with("conductor-")));

    let audit = e.dir.path().join("audit");
    let runs = JsonlRunLog::read_runs(&audit).unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    assert_eq!(runs[0].policy, "bugfix");
    assert_eq!(runs[1].phase, "test");

    let decisions = JsonlRunLog::read_decisions(&audit).unwrap();
    assert!(decisions.iter().any(|d| d.decision_type == DecisionType::PolicyResolution && d.decision == "bugfix"));
    assert!(decisions.iter().any(|d| d.decision_type == DecisionType::MessageSend));
    assert!(decisions.iter().any(|d| d.decision_type == DecisionType::MessageReceipt));

    // The implement -> test handoff reached the test phase prompt.
    let requests = e.platform.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].instructions.contains("from implement]"));
}

#[tokio::test]
async fn test_review_decision_routes_back_to_test() {
    let e = engine(vec![Issue::new("bd-8", "Add filters").with_type("feature")]);
    e.platform
        .push_for("reviewer", ScriptedReply::success("looks good to me"))
        .push_for(
            "reviewer",
            ScriptedReply::success(
                r#"{"decision": "jump_to_test", "reasoning": "edge cases untested", "confidence": 0.9}"#,
            ),
        );

    // plan, implement, test, review
    for _ in 0..4 {
        let report = e.worker.run_cycle(None).await.unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    let issue = e.tracker.snapshot("bd-8").unwrap();
    assert_eq!(issue.status, IssueStatus::Open);
    assert!(issue.has_label("conductor-phase:test"));

    let decisions = JsonlRunLog::read_decisions(&e.dir.path().join("audit")).unwrap();
    let dynamic: Vec<_> = decisions
        .iter()
        .filter(|d| d.decision_type == DecisionType::DynamicDecision)
        .collect();
    assert_eq!(dynamic.len(), 1);
    assert!(dynamic[0].reasoning.contains("edge cases untested"));
}

#[tokio::test]
async fn test_second_writer_is_refused() {
    let dir = TempDir::new().unwrap();
    let _held = JsonlRunLog::open(dir.path()).unwrap();
    let err = JsonlRunLog::open(dir.path()).err().unwrap();
    assert!(err.to_string().contains("Another conductor process"));
}
