//! reportbot: recurring report-duty bot.
//!
//! Usage:
//!   reportbot [serve]        run the scheduler and console chat channel
//!   reportbot run <action>   fire one action now for its current period
//!   reportbot status         print the snapshot and recent job history

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;

use reportbot_lib::scheduler::Scheduler;
use reportbot_lib::state::{get_state_dir, AppState};
use reportbot_lib::types::{ActionKind, JobOutcome};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => {
            let state = Arc::new(AppState::load().context("Failed to start")?);
            reportbot_lib::run(state).await?;
        }
        Some("run") => {
            let action: ActionKind = args
                .get(1)
                .context("usage: reportbot run <action>")?
                .parse()?;
            let state = Arc::new(AppState::load().context("Failed to start")?);
            let scheduler = Scheduler::new(state);
            let (period, report) = scheduler.run_manual(action, Utc::now()).await?;
            println!(
                "{} for {}: {:?} ({} item(s))",
                report.action, period, report.outcome, report.item_count
            );
            if report.outcome == JobOutcome::Failed {
                std::process::exit(1);
            }
        }
        Some("status") => {
            let dir = get_state_dir()?;
            print!("{}", reportbot_lib::status_report(&dir)?);
        }
        Some(other) => bail!(
            "unknown command '{}'; expected serve, run <action> or status",
            other
        ),
    }
    Ok(())
}
