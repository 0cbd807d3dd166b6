//! The worker loop: drives ready issues through their policy's phases.
//!
//! One cycle lists ready work and processes eligible issues one at a time.
//! Per issue:
//!
//! 1. resolve policy and phase, persisting the phase label
//! 2. select an agent (none: log and stop, no run is created)
//! 3. collect unread messages, decide on session reuse, create the run and
//!    mark the issue in progress; a later error fails the run and reopens
//!    the issue
//! 4. dispatch with the rendered prompt, model and reusable session
//! 5. parse the outcome and apply the retroactive timeout
//! 6. let the worker assistant override ambiguous outcomes
//! 7. resolve `dynamic_decision` through the decision agent
//! 8. persist the run, apply the transition, notify the next phase
//!
//! Every decision point appends a [`DecisionRecord`]. Collaborators are
//! injected through [`Ports`].

pub mod apply;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::agents::{AgentProfile, AgentRegistry, SelectionCriteria};
use crate::audit::{DecisionRecord, DecisionType, Run, RunLog, RunStatus};
use crate::decision::{DecisionAgent, EscalationContext, WorkerAssistant, WorkerAssistantConfig, assistant};
use crate::executor::{self, AgentPlatform, DispatchRequest};
use crate::messenger::{MessageType, Messenger, PhaseMessage};
use crate::outcome::Outcome;
use crate::policy::{Phase, Policy, PolicyResolver, PolicyStore};
use crate::prompt::{self, DEFAULT_PHASE_TEMPLATE, Vars};
use crate::session::{self, SessionConfig, SessionDecision};
use crate::tracker::{HitlPolicy, Issue, IssueStatus, IssueTracker, IssueUpdate, LabelConventions};
use crate::transition::{self, Transition, TransitionInput, TransitionKind};

/// `[worker]` section of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Reported only; the loop runs one agent at a time
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_max_issues_per_cycle")]
    pub max_issues_per_cycle: usize,
    /// How many ready issues to fetch per cycle, before filtering
    #[serde(default = "default_ready_limit")]
    pub ready_limit: usize,
    /// Model used when neither the phase nor the agent names one
    #[serde(default)]
    pub default_model: Option<String>,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_concurrent_runs() -> usize {
    1
}

fn default_max_issues_per_cycle() -> usize {
    10
}

fn default_ready_limit() -> usize {
    50
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
            max_issues_per_cycle: default_max_issues_per_cycle(),
            ready_limit: default_ready_limit(),
            default_model: None,
        }
    }
}

/// External collaborators the loop drives.
#[derive(Clone)]
pub struct Ports {
    pub tracker: Arc<dyn IssueTracker>,
    pub registry: Arc<dyn AgentRegistry>,
    pub platform: Arc<dyn AgentPlatform>,
    pub run_log: Arc<dyn RunLog>,
    pub messenger: Arc<dyn Messenger>,
}

/// What happened to one issue in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueReport {
    /// A transition was applied
    Transitioned {
        phase: String,
        run_id: Option<String>,
        kind: TransitionKind,
        next_phase: Option<String>,
        reason: String,
    },
    /// No agent matched the phase; nothing was dispatched
    NoAgent { phase: String },
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub fetched: usize,
    pub excluded: usize,
    pub backing_off: usize,
    pub processed: Vec<(String, IssueReport)>,
    pub errors: Vec<(String, String)>,
    /// Shutdown was requested mid-cycle
    pub interrupted: bool,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        format!(
            "{} fetched, {} processed, {} excluded, {} backing off, {} errors",
            self.fetched,
            self.processed.len(),
            self.excluded,
            self.backing_off,
            self.errors.len()
        )
    }
}

/// Prior failed runs of `phase` for one issue, and their total duration.
///
/// Every failed run counts, including those before a human unblocked the
/// issue, so the retry budget is per issue and phase.
pub fn prior_failures(runs: &[Run], phase: &str) -> (u32, u64) {
    runs.iter()
        .filter(|r| r.phase == phase && r.status == RunStatus::Failed)
        .fold((0, 0), |(count, duration_ms), r| (count + 1, duration_ms + r.duration_ms()))
}

/// Everything a created run needs to finish its attempt.
struct Attempt<'a> {
    issue: &'a Issue,
    policy: &'a Policy,
    phase: &'a Phase,
    agent: &'a AgentProfile,
    current: &'a [String],
    runs: &'a [Run],
    messages: &'a [PhaseMessage],
    prior_duration_ms: u64,
}

fn decision_type_for(kind: TransitionKind) -> DecisionType {
    match kind {
        TransitionKind::Retry => DecisionType::Retry,
        TransitionKind::Block => DecisionType::Hitl,
        _ => DecisionType::PhaseTransition,
    }
}

/// Terminal run status for an attempt that ended in `transition`.
fn run_status(outcome: &Outcome, transition: &Transition) -> RunStatus {
    match transition.kind {
        TransitionKind::Block => RunStatus::Blocked,
        TransitionKind::Retry => RunStatus::Failed,
        _ if outcome.success => RunStatus::Completed,
        _ => RunStatus::Failed,
    }
}

pub struct WorkerLoop {
    config: WorkerConfig,
    store: PolicyStore,
    resolver: PolicyResolver,
    hitl: HitlPolicy,
    assistant: WorkerAssistantConfig,
    session: SessionConfig,
    templates: HashMap<String, String>,
    ports: Ports,
    // Issue id -> earliest time its retry may start.
    not_before: Mutex<HashMap<String, Instant>>,
}

impl WorkerLoop {
    pub fn new(store: PolicyStore, resolver: PolicyResolver, ports: Ports) -> Self {
        Self {
            config: WorkerConfig::default(),
            store,
            resolver,
            hitl: HitlPolicy::default(),
            assistant: WorkerAssistantConfig::default(),
            session: SessionConfig::default(),
            templates: HashMap::new(),
            ports,
            not_before: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hitl(mut self, hitl: HitlPolicy) -> Self {
        self.hitl = hitl;
        self
    }

    pub fn with_assistant(mut self, assistant: WorkerAssistantConfig) -> Self {
        self.assistant = assistant;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_templates(mut self, templates: HashMap<String, String>) -> Self {
        self.templates = templates;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn labels(&self) -> &LabelConventions {
        self.resolver.labels()
    }

    async fn record(&self, record: DecisionRecord) -> Result<()> {
        debug!(
            issue = %record.issue_id,
            kind = %record.decision_type,
            decision = %record.decision,
            "decision"
        );
        self.ports.run_log.append_decision(&record).await
    }

    fn backing_off(&self, issue_id: &str, now: Instant) -> bool {
        let Ok(mut map) = self.not_before.lock() else {
            return false;
        };
        match map.get(issue_id) {
            Some(at) if now < *at => true,
            Some(_) => {
                map.remove(issue_id);
                false
            }
            None => false,
        }
    }

    fn schedule_retry(&self, issue_id: &str, delay: Duration) {
        if let Ok(mut map) = self.not_before.lock() {
            map.insert(issue_id.to_string(), Instant::now() + delay);
        }
    }

    fn clear_retry(&self, issue_id: &str) {
        if let Ok(mut map) = self.not_before.lock() {
            map.remove(issue_id);
        }
    }

    /// Poll until `shutdown` flips to true, finishing the in-flight issue first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            max_issues_per_cycle = self.config.max_issues_per_cycle,
            policies = self.store.policies().len(),
            "worker loop started"
        );
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_cycle(Some(&shutdown)).await?;
            info!(summary = %report.summary(), "cycle finished");
            if report.interrupted {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("worker loop stopped");
        Ok(())
    }

    /// One poll cycle. Only a failure to list ready work is an error;
    /// per-issue failures are collected in the report.
    pub async fn run_cycle(&self, shutdown: Option<&watch::Receiver<bool>>) -> Result<CycleReport> {
        let issues = self
            .ports
            .tracker
            .ready_work(self.config.ready_limit)
            .await
            .context("Failed to list ready work")?;
        let mut report = CycleReport {
            fetched: issues.len(),
            ..Default::default()
        };

        let now = Instant::now();
        for issue in issues {
            if report.processed.len() + report.errors.len() >= self.config.max_issues_per_cycle {
                break;
            }
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                report.interrupted = true;
                break;
            }
            if self.labels().is_excluded(&issue.labels) {
                report.excluded += 1;
                continue;
            }
            if self.backing_off(&issue.id, now) {
                report.backing_off += 1;
                continue;
            }
            match self.process_issue(&issue).await {
                Ok(result) => report.processed.push((issue.id.clone(), result)),
                Err(e) => {
                    error!(issue = %issue.id, error = %format!("{:#}", e), "issue processing failed");
                    report.errors.push((issue.id.clone(), format!("{:#}", e)));
                }
            }
        }
        Ok(report)
    }

    /// Drive one issue through one phase attempt.
    pub async fn process_issue(&self, issue: &Issue) -> Result<IssueReport> {
        let labels = self.labels().clone();

        // 1. Policy and phase.
        let policy = match self.resolver.resolve(&self.store, issue) {
            Ok(resolution) => {
                self.record(
                    DecisionRecord::new(
                        &issue.id,
                        DecisionType::PolicyResolution,
                        resolution.policy.clone(),
                        format!("resolved by {}", resolution.source),
                    )
                    .with_metadata(json!({
                        "source": resolution.source,
                        "warning": resolution.warning,
                    })),
                )
                .await?;
                self.store
                    .get(&resolution.policy)
                    .with_context(|| format!("resolved policy '{}' is not loaded", resolution.policy))?
            }
            Err(e) => {
                self.record(DecisionRecord::new(
                    &issue.id,
                    DecisionType::PolicyResolution,
                    "error",
                    e.to_string(),
                ))
                .await?;
                return Err(e.into());
            }
        };

        let mut current = issue.labels.clone();
        let phase = self.enter_phase(issue, policy, &labels, &mut current).await?;
        let runs = self.ports.run_log.runs_for_issue(&issue.id).await?;

        if let Some(report) = self.resume_approved(issue, policy, phase, &labels, &current, &runs).await? {
            return Ok(report);
        }

        // 2. Agent selection.
        let Some(agent) = self.select_agent(phase).await? else {
            warn!(issue = %issue.id, phase = %phase.name, "no suitable agent");
            self.record(
                DecisionRecord::new(
                    &issue.id,
                    DecisionType::AgentSelection,
                    "none",
                    "no suitable agent",
                )
                .with_metadata(json!({
                    "phase": phase.name,
                    "capabilities": phase.capabilities,
                    "agent": phase.agent,
                    "model": phase.model,
                })),
            )
            .await?;
            return Ok(IssueReport::NoAgent {
                phase: phase.name.clone(),
            });
        };

        // 3. Run, messages, session. Nothing fallible runs between creating
        // the run and the guarded attempt below.
        let (retry_count, prior_duration_ms) = prior_failures(&runs, &phase.name);
        let model = phase
            .model
            .clone()
            .or_else(|| agent.model.clone())
            .or_else(|| self.config.default_model.clone());
        let mut run = Run::new(&issue.id, &agent.id, &policy.name, &phase.name);
        run.metadata.attempt = retry_count + 1;
        run.metadata.retry_count = retry_count;
        run.metadata.model = model;

        let messages = self.ports.messenger.receive(&issue.id, &phase.name, true).await?;
        if !messages.is_empty() {
            self.record(
                DecisionRecord::new(
                    &issue.id,
                    DecisionType::MessageReceipt,
                    format!("{} message(s)", messages.len()),
                    format!("delivered unread messages to '{}'", phase.name),
                )
                .for_run(Some(&run.id))
                .with_metadata(json!({
                    "ids": messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
                })),
            )
            .await?;
        }

        let session = session::decide(&self.session, policy, phase, &runs);
        self.record_session(&issue.id, &run.id, &session).await?;
        run.metadata.resumed_session = session.session_id().map(str::to_string);

        self.ports.run_log.create_run(&run).await?;

        let attempt = Attempt {
            issue,
            policy,
            phase,
            agent: &agent,
            current: &current,
            runs: &runs,
            messages: &messages,
            prior_duration_ms,
        };
        match self.attempt(&attempt, &mut run).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abandon(issue, &mut run, &e).await;
                Err(e)
            }
        }
    }

    /// Dispatch a created run through to its applied transition.
    async fn attempt(&self, a: &Attempt<'_>, run: &mut Run) -> Result<IssueReport> {
        let Attempt {
            issue,
            policy,
            phase,
            agent,
            ..
        } = *a;
        let retry_count = run.metadata.retry_count;
        let model = run.metadata.model.clone();

        self.record(
            DecisionRecord::new(
                &issue.id,
                DecisionType::AgentSelection,
                agent.id.clone(),
                format!("highest-priority agent for phase '{}'", phase.name),
            )
            .for_run(Some(&run.id))
            .with_metadata(json!({
                "priority": agent.priority,
                "model": model,
                "attempt": run.metadata.attempt,
            })),
        )
        .await?;
        info!(
            issue = %issue.id,
            policy = %policy.name,
            phase = %phase.name,
            agent = %agent.id,
            run = %run.id,
            attempt = run.metadata.attempt,
            "dispatching"
        );

        self.ports
            .tracker
            .update(&issue.id, IssueUpdate::new().status(IssueStatus::InProgress))
            .await?;

        // 4. Dispatch.
        let template = match &phase.prompt_template {
            Some(key_or_text) => self
                .templates
                .get(key_or_text)
                .map(String::as_str)
                .unwrap_or(key_or_text.as_str()),
            None => DEFAULT_PHASE_TEMPLATE,
        };
        let mut vars = Vars::for_phase(issue, policy, phase).with_messages(a.messages);
        vars.set("history", prompt::visit_history(a.runs))
            .set("attempt", run.metadata.attempt.to_string())
            .set("agent", agent.id.clone());
        let request = DispatchRequest::new(agent.id.clone(), prompt::render(template, &vars))
            .with_model(model.clone())
            .with_session(run.metadata.resumed_session.clone());

        let started = Instant::now();
        let mut outcome = match self.ports.platform.dispatch(&request).await {
            Ok(execution) => execution.into_outcome(),
            Err(e) => {
                warn!(issue = %issue.id, run = %run.id, error = %e, "dispatch failed");
                executor::transport_failure(&e, started.elapsed())
            }
        };
        if outcome.metrics.model.is_none() {
            outcome.metrics.model = model;
        }

        // 5. Retroactive timeout.
        let limit = transition::phase_timeout(policy, phase);
        if transition::enforce_timeout(&mut outcome, limit) {
            warn!(issue = %issue.id, run = %run.id, timeout_ms = limit.as_millis() as u64, "phase attempt timed out");
            self.record(
                DecisionRecord::new(
                    &issue.id,
                    DecisionType::Timeout,
                    "failed",
                    outcome.message.clone(),
                )
                .for_run(Some(&run.id))
                .with_metadata(json!({
                    "duration_ms": outcome.metrics.duration_ms,
                    "timeout_ms": limit.as_millis() as u64,
                })),
            )
            .await?;
        }

        // 6 + 7. Transition, assistant override, decision routing.
        let approved = self.labels().is_approved(a.current, &phase.name);
        let base = transition::determine(
            policy,
            phase,
            TransitionInput::from_outcome(&outcome, retry_count).with_approval_granted(approved),
        );
        let ctx = EscalationContext {
            issue,
            policy,
            phase,
            outcome: &outcome,
            retry_count,
            history: a.runs,
        };
        let transition = self.consult_assistant(&ctx, base, &run.id).await?;
        let transition = self.route_dynamic(&ctx, transition, Some(&run.id)).await?;

        // 8. Persist and apply.
        run.metadata.cumulative_duration_ms = a.prior_duration_ms + outcome.metrics.duration_ms;
        let summary = outcome.summary();
        // `run` turns terminal only once the log has accepted it.
        let mut finished = run.clone();
        finished.finish(run_status(&outcome, &transition), outcome);
        self.ports.run_log.update_run(&finished).await?;
        *run = finished;
        info!(
            issue = %issue.id,
            phase = %phase.name,
            run = %run.id,
            status = %run.status,
            outcome = %summary,
            "run finished"
        );

        self.apply(issue, policy, phase, a.current, &transition, Some(&*run))
            .await?;

        Ok(IssueReport::Transitioned {
            phase: phase.name.clone(),
            run_id: Some(run.id.clone()),
            kind: transition.kind,
            next_phase: transition.next_phase,
            reason: transition.reason,
        })
    }

    /// Close out a run whose attempt errored and hand the issue back to the
    /// ready queue. Best effort: the original error is what gets reported.
    async fn abandon(&self, issue: &Issue, run: &mut Run, err: &anyhow::Error) {
        if !run.status.is_terminal() {
            run.finish(
                RunStatus::Failed,
                Outcome::failure("orchestrator_error", format!("{:#}", err)),
            );
            if let Err(e) = self.ports.run_log.update_run(run).await {
                error!(issue = %issue.id, run = %run.id, error = %format!("{:#}", e), "failed to close abandoned run");
            }
        }
        if let Err(e) = self
            .ports
            .tracker
            .update(&issue.id, IssueUpdate::new().status(IssueStatus::Open))
            .await
        {
            error!(issue = %issue.id, error = %format!("{:#}", e), "failed to reopen issue");
        }
        warn!(issue = %issue.id, run = %run.id, status = %run.status, "attempt abandoned");
    }

    /// Resume from the phase label, or start at the first phase.
    async fn enter_phase<'p>(
        &self,
        issue: &Issue,
        policy: &'p Policy,
        labels: &LabelConventions,
        current: &mut Vec<String>,
    ) -> Result<&'p Phase> {
        let resumed = labels
            .current_phase(current)
            .and_then(|name| policy.phase(name));
        let phase = match resumed {
            Some(phase) => phase,
            None => policy
                .first_phase()
                .with_context(|| format!("policy '{}' has no phases", policy.name))?,
        };

        let mut update = IssueUpdate::new();
        if !labels.is_managed(current) {
            update = update.add_label(labels.managed());
        }
        if resumed.is_none() {
            let stale = labels.phase_labels(current);
            if !stale.is_empty() {
                warn!(issue = %issue.id, stale = ?stale, policy = %policy.name, "phase label not in policy, restarting");
            }
            update = update
                .remove_labels(stale)
                .add_label(labels.phase(&phase.name));
        }
        if !update.is_empty() {
            self.ports.tracker.update(&issue.id, update.clone()).await?;
            current.retain(|l| !update.remove_labels.contains(l));
            current.extend(update.add_labels);
        }
        Ok(phase)
    }

    async fn select_agent(&self, phase: &Phase) -> Result<Option<AgentProfile>> {
        let criteria = SelectionCriteria {
            capabilities: phase.capabilities.clone(),
            agent_id: phase.agent.clone(),
            model: phase.model.clone(),
            constraints: phase.constraints.clone(),
        };
        self.ports.registry.select_agent(&criteria).await
    }

    /// An issue reopened with `<prefix>-approved:<phase>` after an approval
    /// block continues from the stored outcome without a new dispatch.
    async fn resume_approved(
        &self,
        issue: &Issue,
        policy: &Policy,
        phase: &Phase,
        labels: &LabelConventions,
        current: &[String],
        runs: &[Run],
    ) -> Result<Option<IssueReport>> {
        if !labels.is_approved(current, &phase.name) {
            return Ok(None);
        }
        let Some(last) = runs.last() else {
            return Ok(None);
        };
        let Some(outcome) = last.outcome.as_ref() else {
            return Ok(None);
        };
        if last.phase != phase.name || last.status != RunStatus::Blocked || !outcome.success {
            return Ok(None);
        }

        info!(issue = %issue.id, phase = %phase.name, run = %last.id, "approval granted, resuming");
        self.record(
            DecisionRecord::new(
                &issue.id,
                DecisionType::Hitl,
                "approved",
                format!("human approved phase '{}'", phase.name),
            )
            .for_run(Some(&last.id)),
        )
        .await?;

        let input = TransitionInput {
            success: true,
            retry_count: 0,
            requires_approval: false,
            approval_granted: true,
        };
        let base = transition::determine(policy, phase, input);
        let ctx = EscalationContext {
            issue,
            policy,
            phase,
            outcome,
            retry_count: 0,
            history: runs,
        };
        let transition = self.route_dynamic(&ctx, base, Some(&last.id)).await?;
        self.apply(issue, policy, phase, current, &transition, Some(last))
            .await?;

        Ok(Some(IssueReport::Transitioned {
            phase: phase.name.clone(),
            run_id: None,
            kind: transition.kind,
            next_phase: transition.next_phase,
            reason: transition.reason,
        }))
    }

    async fn record_session(&self, issue_id: &str, run_id: &str, session: &SessionDecision) -> Result<()> {
        let record = match session {
            SessionDecision::NotRequested => return Ok(()),
            SessionDecision::Reuse {
                session_id,
                source_phase,
                tokens_used,
            } => DecisionRecord::new(
                issue_id,
                DecisionType::SessionContinuation,
                "reuse",
                format!("resuming session of phase '{}'", source_phase),
            )
            .with_metadata(json!({
                "session_id": session_id,
                "source_phase": source_phase,
                "tokens_used": tokens_used,
                "token_budget": self.session.token_budget(),
            })),
            SessionDecision::Fresh { reason } => {
                info!(issue = %issue_id, reason = %reason, "starting fresh session");
                DecisionRecord::new(issue_id, DecisionType::SessionContinuation, "fresh", reason.clone())
            }
        };
        self.record(record.for_run(Some(run_id))).await
    }

    async fn consult_assistant(
        &self,
        ctx: &EscalationContext<'_>,
        base: Transition,
        run_id: &str,
    ) -> Result<Transition> {
        if !self.assistant.enabled_for(ctx.policy, ctx.phase) {
            return Ok(base);
        }
        let Some(trigger) = self.assistant.trigger_reason(ctx.outcome) else {
            return Ok(base);
        };
        if !assistant::can_override(&base) {
            debug!(issue = %ctx.issue.id, transition = %base.kind, "assistant trigger ignored for this transition");
            return Ok(base);
        }

        let verdict = WorkerAssistant::new(
            &self.assistant,
            self.ports.registry.as_ref(),
            self.ports.platform.as_ref(),
        )
        .consult(ctx, &trigger, &base)
        .await;
        let note = verdict.fallback_reason.clone().unwrap_or_else(|| trigger.clone());
        let transition =
            assistant::apply_directive(verdict.directive, ctx.policy, ctx.phase, ctx.retry_count, &note);

        self.record(
            DecisionRecord::new(
                &ctx.issue.id,
                DecisionType::WorkerAssistant,
                verdict.directive.to_string(),
                match &verdict.fallback_reason {
                    Some(reason) => format!("fallback: {}", reason),
                    None => format!("assistant reviewed: {}", trigger),
                },
            )
            .for_run(Some(run_id))
            .with_metadata(json!({
                "trigger": trigger,
                "base": base.kind,
                "result": transition.kind,
                "agent": verdict.agent_id,
                "fallback": verdict.used_fallback(),
                "reply": verdict.reply.as_deref().map(|r| crate::outcome::truncate(r, 500)),
            })),
        )
        .await?;
        Ok(transition)
    }

    async fn route_dynamic(
        &self,
        ctx: &EscalationContext<'_>,
        transition: Transition,
        run_id: Option<&str>,
    ) -> Result<Transition> {
        if transition.kind != TransitionKind::DynamicDecision {
            return Ok(transition);
        }
        let config = transition.decision.clone().unwrap_or_default();
        let verdict = DecisionAgent::new(
            self.ports.registry.as_ref(),
            self.ports.platform.as_ref(),
            &self.templates,
        )
        .decide(ctx, &config)
        .await;

        let (decision, confidence) = match &verdict.reply {
            Some(reply) => (reply.decision.clone(), Some(reply.confidence)),
            None => ("invalid".to_string(), None),
        };
        self.record(
            DecisionRecord::new(
                &ctx.issue.id,
                DecisionType::DynamicDecision,
                decision,
                verdict.transition.reason.clone(),
            )
            .for_run(run_id)
            .with_metadata(json!({
                "agent": verdict.agent_id,
                "confidence": confidence,
                "attempts": verdict.attempts,
                "failures": verdict.failures,
                "result": verdict.transition.kind,
                "target": verdict.transition.next_phase,
                "recommendations": verdict.reply.as_ref().map(|r| r.recommendations.clone()),
            })),
        )
        .await?;
        Ok(verdict.transition)
    }

    /// Log the transition, update the issue, schedule retries and notify the next phase.
    async fn apply(
        &self,
        issue: &Issue,
        policy: &Policy,
        phase: &Phase,
        current: &[String],
        transition: &Transition,
        run: Option<&Run>,
    ) -> Result<()> {
        let run_id = run.map(|r| r.id.as_str());
        self.record(
            DecisionRecord::new(
                &issue.id,
                decision_type_for(transition.kind),
                match &transition.next_phase {
                    Some(next) => format!("{} -> {}", transition.kind, next),
                    None => transition.kind.to_string(),
                },
                transition.reason.clone(),
            )
            .for_run(run_id)
            .with_metadata(json!({
                "policy": policy.name,
                "from_phase": phase.name,
                "next_phase": transition.next_phase,
                "retry_delay_ms": transition.retry_delay.map(|d| d.as_millis() as u64),
                "hitl_reason": transition.hitl_reason,
            })),
        )
        .await?;

        let update = apply::issue_update(self.labels(), &self.hitl, current, policy, phase, transition)?;
        self.ports.tracker.update(&issue.id, update).await?;
        info!(
            issue = %issue.id,
            phase = %phase.name,
            transition = %transition.kind,
            next = transition.next_phase.as_deref().unwrap_or("-"),
            reason = %transition.reason,
            "transition applied"
        );

        match transition.retry_delay {
            Some(delay) if transition.kind == TransitionKind::Retry => self.schedule_retry(&issue.id, delay),
            _ => self.clear_retry(&issue.id),
        }

        if transition.kind == TransitionKind::Advance
            && let Some(next) = transition.next_phase.as_deref()
        {
            let content = run
                .and_then(|r| r.outcome.as_ref())
                .map(|o| o.message.clone())
                .unwrap_or_default();
            let message = PhaseMessage::new(&issue.id, &phase.name, next, MessageType::Result, content)
                .with_metadata(json!({
                    "run_id": run_id,
                    "agent": run.map(|r| r.agent_id.as_str()),
                }));
            let message_id = message.id.clone();
            self.ports.messenger.send(message).await?;
            self.record(
                DecisionRecord::new(
                    &issue.id,
                    DecisionType::MessageSend,
                    format!("result -> {}", next),
                    format!("phase '{}' result forwarded", phase.name),
                )
                .for_run(run_id)
                .with_metadata(json!({ "message_id": message_id })),
            )
            .await?;
        }
        Ok(())
    }
}
