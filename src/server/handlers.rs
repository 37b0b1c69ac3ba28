//! Command routing and handlers.
//!
//! Handlers receive positional JSON arguments and return a JSON result.
//! Classification problems never surface as errors: a line or payload that
//! cannot be classified answers `{"detected": false, "reason": ...}`.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::{debug, info};

use super::GovernorContext;
use crate::decision::HealthOverride;
use crate::error::{GatewayError, GatewayResult};
use crate::ingest::parse_line;
use crate::issues::{Detection, ManualIssue, ResolveTarget};
use crate::storage::{normalize_issue_type, FixOutcome};

/// Every command the gateway understands, in display order.
pub const AVAILABLE_COMMANDS: &[&str] = &[
    "should-start-investigation",
    "should-pause-unity",
    "should-resume-unity",
    "get-investigation-status",
    "start-investigation",
    "complete-investigation",
    "detect-issue",
    "add-issue",
    "get-active-issues",
    "resolve-issue",
    "get-suggested-fixes",
    "record-fix-attempt",
    "check-fix",
    "get-live-statistics",
    "query",
    "get-status-report",
    "ping",
    "shutdown",
];

/// Source name attached to lines submitted through `detect-issue`.
const GATEWAY_SOURCE: &str = "gateway";

pub fn is_known_command(command: &str) -> bool {
    AVAILABLE_COMMANDS.contains(&command)
}

/// Route a command to its handler.
pub async fn handle_command(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    debug!(command = %command, args = args.len(), "Routing command");

    match command {
        "should-pause-unity" => handle_should_pause(ctx, command, args).await,
        "should-resume-unity" => handle_should_resume(ctx, command, args).await,
        "should-start-investigation" => handle_should_start(ctx, command, args).await,
        "get-investigation-status" => to_json(ctx.state().investigation_status().await),
        "start-investigation" => handle_start_investigation(ctx, command, args).await,
        "complete-investigation" => handle_complete_investigation(ctx).await,
        "detect-issue" => handle_detect_issue(ctx, command, args).await,
        "add-issue" => handle_add_issue(ctx, command, args).await,
        "get-active-issues" => handle_active_issues(ctx).await,
        "resolve-issue" => handle_resolve_issue(ctx, command, args).await,
        "get-suggested-fixes" => handle_suggested_fixes(ctx, command, args).await,
        "record-fix-attempt" => handle_record_fix_attempt(ctx, command, args).await,
        "check-fix" => handle_check_fix(ctx, command, args).await,
        "get-live-statistics" => live_statistics(ctx).await,
        "query" => handle_query(ctx, command, args).await,
        "get-status-report" => handle_status_report(ctx).await,
        _ => Err(GatewayError::UnknownCommand {
            command: command.to_string(),
        }),
    }
}

pub(crate) fn ping_result(initialized: bool) -> Value {
    json!({ "pong": true, "initialized": initialized })
}

// ============================================================================
// Argument helpers
// ============================================================================

/// Positional argument as text; scalars are stringified, objects serialized.
fn text_arg(args: &[Value], idx: usize) -> Option<String> {
    match args.get(idx)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn required_text(command: &str, args: &[Value], idx: usize, name: &str) -> GatewayResult<String> {
    text_arg(args, idx).ok_or_else(|| GatewayError::invalid(command, format!("missing {}", name)))
}

fn optional_value(args: &[Value], idx: usize) -> Option<&Value> {
    args.get(idx).filter(|v| !v.is_null())
}

fn health_arg(command: &str, args: &[Value]) -> GatewayResult<Option<HealthOverride>> {
    optional_value(args, 0)
        .map(|v| HealthOverride::from_value(v).map_err(|e| GatewayError::invalid(command, e)))
        .transpose()
}

fn to_json<T: serde::Serialize>(value: T) -> GatewayResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn detection_result(detection: Detection) -> Value {
    json!({
        "detected": true,
        "isNew": detection.is_new,
        "issue": detection.issue,
    })
}

fn not_detected(reason: impl Into<String>) -> Value {
    json!({ "detected": false, "reason": reason.into() })
}

// ============================================================================
// Decisions and investigation
// ============================================================================

async fn handle_should_pause(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let health = health_arg(command, args)?;
    let snapshot = ctx.state().decision_snapshot(health.as_ref()).await;
    to_json(snapshot.should_pause_unity())
}

async fn handle_should_resume(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let health = health_arg(command, args)?;
    let snapshot = ctx.state().decision_snapshot(health.as_ref()).await;
    to_json(snapshot.should_resume_unity())
}

async fn handle_should_start(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let health = health_arg(command, args)?;
    let snapshot = ctx.state().decision_snapshot(health.as_ref()).await;
    to_json(snapshot.should_start_investigation())
}

async fn handle_start_investigation(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let timeout_secs = match text_arg(args, 0) {
        Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
            GatewayError::invalid(command, format!("timeout must be whole seconds, got {}", raw))
        })?),
        None => None,
    };

    let decision = ctx
        .state()
        .decision_snapshot(None)
        .await
        .should_start_investigation();

    match ctx
        .state()
        .start_investigation(Some(decision.clone()), timeout_secs)
        .await
    {
        Ok(investigation) => Ok(json!({
            "started": true,
            "investigation": investigation,
            "decision": decision,
        })),
        Err(e) => Ok(json!({
            "started": false,
            "reason": e.to_string(),
            "investigation": ctx.state().investigation_status().await,
            "decision": decision,
        })),
    }
}

async fn handle_complete_investigation(ctx: &GovernorContext) -> GatewayResult<Value> {
    let completion = ctx.state().complete_investigation().await;
    Ok(json!({
        "completed": true,
        "completion": completion,
        "investigation": ctx.state().investigation_status().await,
    }))
}

// ============================================================================
// Issues
// ============================================================================

async fn handle_detect_issue(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let line = required_text(command, args, 0, "log line")?;
    let source = text_arg(args, 1).unwrap_or_else(|| GATEWAY_SOURCE.to_string());

    let Some(record) = parse_line(&line, &source) else {
        return Ok(not_detected("Line ignored as internal or empty"));
    };
    match ctx.state().detect_record(&record).await {
        Some(detection) => Ok(detection_result(detection)),
        None => Ok(not_detected("No matching pattern")),
    }
}

async fn handle_add_issue(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let payload =
        optional_value(args, 0).ok_or_else(|| GatewayError::invalid(command, "missing issue payload"))?;

    let manual = match ManualIssue::from_value(payload) {
        Ok(manual) => manual,
        Err(reason) => {
            debug!(reason = %reason, "Rejected manual issue payload");
            return Ok(not_detected(format!("Invalid issue payload: {}", reason)));
        }
    };
    let detection = ctx.state().detect(manual.into_issue()).await;
    Ok(detection_result(detection))
}

async fn handle_active_issues(ctx: &GovernorContext) -> GatewayResult<Value> {
    let issues = ctx.state().active_issues().await;
    Ok(json!({ "count": issues.len(), "issues": issues }))
}

async fn handle_resolve_issue(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let target = ResolveTarget::parse(&required_text(command, args, 0, "issue id or \"all\"")?);
    let removed = ctx.state().resolve(&target).await;

    if let ResolveTarget::One(id) = &target {
        if removed.is_empty() {
            return Err(GatewayError::NotFound {
                message: format!("No active issue {}", id),
            });
        }
    }

    let remaining = ctx.state().ledger_stats().await.active;
    Ok(json!({
        "resolved": removed.len(),
        "issues": removed,
        "remaining": remaining,
    }))
}

// ============================================================================
// Fix memory
// ============================================================================

/// Map an issue id (or fingerprint) to its type; anything else is taken as
/// a type already.
async fn issue_type_for(ctx: &GovernorContext, key: &str) -> (String, Option<String>) {
    match ctx.state().find_issue(key).await {
        Some(issue) => (normalize_issue_type(&issue.issue_type), Some(issue.id)),
        None => (normalize_issue_type(key), None),
    }
}

async fn handle_suggested_fixes(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let key = required_text(command, args, 0, "issue id")?;
    let issue = ctx.state().find_issue(&key).await;

    let issue_type = match &issue {
        Some(issue) => normalize_issue_type(&issue.issue_type),
        None => normalize_issue_type(&key),
    };
    let rule_fixes = match issue.as_ref().and_then(|i| i.possible_fixes.clone()) {
        Some(fixes) => fixes,
        None => ctx.state().classifier().fixes_for(&issue_type),
    };

    let history = ctx.memory().history(&issue_type).await?;
    if issue.is_none() && rule_fixes.is_empty() && history.is_empty() {
        return Err(GatewayError::NotFound {
            message: format!("No active issue or known issue type {}", key),
        });
    }

    let failed = ctx.memory().failed_methods(&issue_type).await?;
    let failures_of = |fix: &str| {
        let key = fix.trim().to_lowercase();
        failed
            .iter()
            .find(|m| m.method == key)
            .map(|m| m.frequency)
            .unwrap_or(0)
    };

    let mut suggestions: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    // Known-good fixes first, most recent success first.
    for attempt in history.iter().rev().filter(|a| a.outcome.is_success()) {
        let key = attempt.fix_description.trim().to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        suggestions.push(json!({
            "fix": attempt.fix_description,
            "origin": "history",
            "lastSucceeded": attempt.timestamp,
            "previouslyFailed": failures_of(&attempt.fix_description) > 0,
            "failureCount": failures_of(&attempt.fix_description),
        }));
    }
    for fix in &rule_fixes {
        let key = fix.trim().to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        suggestions.push(json!({
            "fix": fix,
            "origin": "rule",
            "previouslyFailed": failures_of(fix) > 0,
            "failureCount": failures_of(fix),
        }));
    }

    Ok(json!({
        "issueId": issue.as_ref().map(|i| i.id.clone()),
        "issueType": issue_type,
        "rootCause": issue.as_ref().and_then(|i| i.root_cause.clone()),
        "suggestions": suggestions,
        "failedMethods": failed,
        "summary": crate::storage::FixSummary::from_attempts(&history),
    }))
}

async fn handle_record_fix_attempt(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let key = required_text(command, args, 0, "issue id or type")?;
    let fix = required_text(command, args, 1, "fix method")?;
    let outcome = required_text(command, args, 2, "result")?
        .parse::<FixOutcome>()
        .map_err(|e| GatewayError::invalid(command, e))?;
    let details = optional_value(args, 3).map(|v| match v {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| v.clone()),
        other => other.clone(),
    });

    let (issue_type, issue_id) = issue_type_for(ctx, &key).await;
    let summary = ctx
        .memory()
        .record(&issue_type, &fix, outcome, details)
        .await?;

    let mut resolved = false;
    if outcome.is_success() {
        if let Some(id) = &issue_id {
            resolved = !ctx
                .state()
                .resolve(&ResolveTarget::One(id.clone()))
                .await
                .is_empty();
            if resolved {
                info!(issue_id = %id, "Issue resolved by successful fix");
            }
        }
    }

    Ok(json!({
        "recorded": true,
        "issueType": issue_type,
        "issueId": issue_id,
        "outcome": outcome,
        "resolved": resolved,
        "totalAttempts": summary.total_attempts,
        "successCount": summary.success_count,
        "failureCount": summary.failure_count,
    }))
}

async fn handle_check_fix(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let key = required_text(command, args, 0, "issue type")?;
    let proposed = required_text(command, args, 1, "proposed fix")?;
    let (issue_type, _) = issue_type_for(ctx, &key).await;
    to_json(ctx.memory().check(&issue_type, &proposed).await?)
}

// ============================================================================
// Reporting
// ============================================================================

async fn live_statistics(ctx: &GovernorContext) -> GatewayResult<Value> {
    let state = ctx.state();
    let ledger = state.ledger_stats().await;
    let by_severity: BTreeMap<&str, usize> = ledger
        .by_severity
        .iter()
        .map(|(severity, count)| (severity.as_str(), *count))
        .collect();
    let memory = ctx.memory().totals().await?;

    Ok(json!({
        "activeIssues": ledger.active,
        "issuesBySeverity": by_severity,
        "totalDetections": ledger.total_detections,
        "fixMemory": memory,
        "investigation": state.investigation_status().await,
        "governed": state.governed().await,
        "commandsProcessed": state.commands_processed(),
        "uptimeSeconds": state.uptime_secs(),
    }))
}

async fn handle_query(
    ctx: &GovernorContext,
    command: &str,
    args: &[Value],
) -> GatewayResult<Value> {
    let text = args
        .iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(" ");
    let needle = text.trim().to_lowercase();
    if needle.is_empty() {
        return Err(GatewayError::invalid(command, "missing query text"));
    }

    let issues: Vec<_> = ctx
        .state()
        .active_issues()
        .await
        .into_iter()
        .filter(|i| {
            i.issue_type.to_lowercase().contains(&needle)
                || i.message.to_lowercase().contains(&needle)
                || i.source.as_str().contains(&needle)
                || i
                    .root_cause
                    .as_deref()
                    .map(|c| c.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
        .collect();

    let mut types: Vec<String> = issues
        .iter()
        .map(|i| normalize_issue_type(&i.issue_type))
        .collect();
    for known in ctx.memory().issue_types().await? {
        if known.to_lowercase().contains(&needle) {
            types.push(known);
        }
    }
    types.sort();
    types.dedup();

    let mut fix_history = BTreeMap::new();
    for issue_type in types {
        let history = ctx.memory().history(&issue_type).await?;
        if !history.is_empty() {
            fix_history.insert(issue_type, history);
        }
    }

    Ok(json!({
        "query": text.trim(),
        "issues": issues,
        "fixHistory": fix_history,
    }))
}

async fn handle_status_report(ctx: &GovernorContext) -> GatewayResult<Value> {
    let snapshot = ctx.state().decision_snapshot(None).await;
    Ok(json!({
        "decisions": {
            "shouldPauseUnity": snapshot.should_pause_unity(),
            "shouldResumeUnity": snapshot.should_resume_unity(),
            "shouldStartInvestigation": snapshot.should_start_investigation(),
        },
        "investigation": ctx.state().investigation_status().await,
        "activeIssues": snapshot.active,
        "statistics": live_statistics(ctx).await?,
    }))
}
