pub mod dedup;
pub mod document;
pub mod error;
pub mod executor;
pub mod feishu;
pub mod gateway;
pub mod ledger;
pub mod reconcile;
pub mod render;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;
pub mod window;

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};

use error::BotError;
use ledger::JobLedger;
use router::CommandRouter;
use scheduler::Scheduler;
use state::AppState;
use store::WorkItemStore;

/// Ledger entries shown by `status`.
const STATUS_HISTORY_LIMIT: usize = 10;

/// Run the bot until ctrl-c: scheduler loop plus the console chat channel.
pub async fn run(state: Arc<AppState>) -> Result<(), BotError> {
    if let Err(e) = state.gateway.authenticate().await {
        if e.requires_user_action() {
            return Err(e);
        }
        log::warn!("Initial authentication failed, will retry on demand: {}", e);
    }

    let router = state.router()?;
    let scheduler = Scheduler::new(state.clone());

    tokio::select! {
        _ = scheduler.run() => {}
        result = run_console(&router) => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }
    Ok(())
}

/// Read `<actor> <message>` lines from stdin and answer through the router.
///
/// Stdin closing (e.g. when run as a service) leaves the scheduler running.
async fn run_console(router: &CommandRouter) -> Result<(), BotError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some((actor, text)) = parse_console_line(&line) else {
            continue;
        };
        let reply = router.route(text, actor, Utc::now()).await;
        println!("{}", reply.text);
    }
    log::debug!("Console input closed");
    std::future::pending::<()>().await;
    Ok(())
}

fn parse_console_line(line: &str) -> Option<(&str, &str)> {
    let (actor, text) = line.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some((actor, text))
}

/// Human-readable snapshot and recent ledger history.
///
/// Reads the persisted documents only, so it works without credentials.
pub fn status_report(state_dir: &Path) -> Result<String, BotError> {
    let store = WorkItemStore::open(state_dir.join(state::WORK_ITEMS_FILE))?;
    let ledger = JobLedger::open(state_dir.join(state::LEDGER_FILE))?;
    let snapshot = store.snapshot();

    let mut out = String::new();
    let period = if snapshot.period.is_empty() { "-" } else { &snapshot.period };
    let _ = writeln!(out, "Period: {}", period);
    let _ = writeln!(
        out,
        "Items: {}/{} complete ({:.2}%)",
        snapshot.completed, snapshot.total, snapshot.rate
    );
    for (category, tally) in &snapshot.by_category {
        let _ = writeln!(out, "  {}: {}/{}", category, tally.completed, tally.total);
    }

    let history = ledger.history(STATUS_HISTORY_LIMIT);
    if history.is_empty() {
        let _ = writeln!(out, "No jobs have fired yet");
    } else {
        let _ = writeln!(out, "Recent jobs:");
        for entry in history {
            let _ = writeln!(
                out,
                "  {} {} {:?} items={}{} at {}",
                entry.period,
                entry.action,
                entry.outcome,
                entry.item_count,
                if entry.manual { " (manual)" } else { "" },
                entry.fired_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(out)
}
