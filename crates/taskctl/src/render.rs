//! Output rendering for the taskctl CLI.

use chrono::{DateTime, Local, Utc};
use task_core::{Attempt, AuditEvent, Checkpoint, Task, TaskState};

use crate::client::Summary;

/// Print confirmation after enqueueing a task.
pub fn print_task_created(task: &Task) {
    println!("Enqueued task: {}", task.id);
    println!("  Title:    {}", task.title);
    println!("  Kind:     {}", task.kind.as_str());
    println!("  Priority: {}", task.priority);
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(AsRef::as_ref).collect();
        println!("  Depends:  {}", deps.join(", "));
    }
    println!("  State:    {}", task.state.as_str());
}

/// Print tasks in tabular format.
pub fn print_task_list(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<16}  {:<30}  {:<9}  {:<12}  {:>8}  {:<20}",
        "ID", "TITLE", "KIND", "STATE", "ATTEMPTS", "CREATED"
    );
    println!("{}", "-".repeat(104));

    for task in tasks {
        println!(
            "{:<16}  {:<30}  {:<9}  {:<12}  {:>8}  {:<20}",
            truncate(task.id.as_ref(), 16),
            truncate(&task.title, 30),
            task.kind.as_str(),
            task.state.as_str(),
            format!("{}/{}", task.attempt_count, task.max_attempts),
            format_time(&task.created_at),
        );
    }

    println!();
    println!("{} task(s)", tasks.len());
}

/// Print detailed information about a task.
pub fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!();
    println!("  Title:        {}", task.title);
    println!("  Kind:         {}", task.kind.as_str());
    println!("  State:        {}", task.state.as_str());
    println!("  Priority:     {}", task.priority);
    println!(
        "  Attempts:     {}/{}",
        task.attempt_count, task.max_attempts
    );
    if !task.dependencies.is_empty() {
        let deps: Vec<&str> = task.dependencies.iter().map(AsRef::as_ref).collect();
        println!("  Depends on:   {}", deps.join(", "));
    }
    if let Some(ref session) = task.assigned_session {
        println!("  Session:      {}", session);
    }
    if let Some(ref reason) = task.block_reason {
        println!("  Block reason: {}", reason);
    }
    println!("  Created:      {}", format_time(&task.created_at));
    println!("  Updated:      {}", format_time(&task.updated_at));
}

/// Print the audit trail for a task.
pub fn print_audit(events: &[AuditEvent]) {
    if events.is_empty() {
        println!("No audit events.");
        return;
    }

    for event in events {
        println!(
            "{}  {:<22}  {:<12}  {}",
            format_time(&event.timestamp),
            event.event_type,
            event.actor,
            event.payload_json,
        );
    }

    println!();
    println!("{} event(s)", events.len());
}

/// Print the attempt history for a task.
pub fn print_attempts(attempts: &[Attempt]) {
    if attempts.is_empty() {
        println!("No attempts recorded.");
        return;
    }

    for attempt in attempts {
        println!("Attempt {} ({})", attempt.sequence_number, attempt.id);
        println!("  Started: {}", format_time(&attempt.started_at));
        if let Some(ended) = attempt.ended_at {
            println!("  Ended:   {}", format_time(&ended));
        }
        if !attempt.changed_resources.is_empty() {
            println!("  Changed: {}", attempt.changed_resources.join(", "));
        }
        for tier in &attempt.verifier_results {
            let status = if tier.passed { "pass" } else { "FAIL" };
            println!("  Tier {:<12} {} ({}ms)", tier.tier, status, tier.duration_ms);
        }
        if let Some(ref verdict) = attempt.verdict {
            println!(
                "  Verdict: {} [{}] {}",
                verdict.decision.as_str(),
                verdict.reason.code(),
                verdict.summary,
            );
        }
        println!();
    }
}

/// Print checkpoint history for a task.
pub fn print_checkpoints(checkpoints: &[Checkpoint]) {
    if checkpoints.is_empty() {
        println!("No checkpoints recorded.");
        return;
    }

    for cp in checkpoints {
        println!(
            "{}  attempt {}  phase {:<10}  status {}",
            format_time(&cp.saved_at),
            cp.sequence_number,
            cp.phase.as_str(),
            cp.status.as_str(),
        );
        for step in &cp.next_steps {
            println!("    next: {}", truncate(step, 100));
        }
    }
}

/// Print the daemon summary.
pub fn print_summary(summary: &Summary) {
    println!("Kill switch: {}", summary.mode.as_str());
    println!("Active loops: {}", summary.active_loops);
    println!();

    let count_for = |state: TaskState| {
        summary
            .counts
            .iter()
            .find(|c| c.state == state)
            .map(|c| c.count)
            .unwrap_or(0)
    };
    for state in [
        TaskState::Pending,
        TaskState::InProgress,
        TaskState::Blocked,
        TaskState::Completed,
        TaskState::Cancelled,
    ] {
        println!("  {:<12} {}", state.as_str(), count_for(state));
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
