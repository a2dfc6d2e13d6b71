use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hive::config::Config;
use hive::core::{GraphStore, TaskId, WorkspaceStatus};
use hive::orchestration::{analyze, Inbox, LocalLauncher, ProcProbe, Scheduler, SchedulerEvent};
use hive::snapshot::Snapshot;
use hive::store::StateStore;
use hive::workspace::WorkspaceManager;
use hive::{hlog, hlog_warn, Error, Plan, Result};

/// Hive - run a dependency graph of tasks across isolated worker processes
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Repository to orchestrate (defaults to the current directory)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Submit a plan and run until every task is settled
    Run {
        /// TOML plan file
        plan: PathBuf,
    },
    /// Continue the previous run from the saved state
    Resume,
    /// Validate a plan and print its deadlock analysis as JSON
    Check {
        /// TOML plan file
        plan: PathBuf,
    },
    /// Print the last published snapshot
    Status,
    /// Return a blocked task to scheduling
    Unblock {
        /// Task id
        task: String,
    },
    /// Hide a finished task from listings
    Archive {
        /// Task id
        task: String,
    },
    /// Clean merged workspaces and report orphaned worktrees and branches
    Cleanup {
        /// Actually delete orphans (default: just report)
        #[arg(long)]
        delete: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    hive::log::init_with_debug(cli.debug);

    let repo = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Run { plan } => run_plan(&repo, Some(&plan)),
        Command::Resume => run_plan(&repo, None),
        Command::Check { plan } => run_check(&plan),
        Command::Status => run_status(),
        Command::Unblock { task } => run_unblock(&task),
        Command::Archive { task } => run_archive(&task),
        Command::Cleanup { delete } => run_cleanup(&repo, delete),
    }
}

/// Build the scheduler, load saved state, optionally submit a plan, and
/// drive the loop until it drains or Ctrl-C.
fn run_plan(repo: &Path, plan: Option<&Path>) -> Result<()> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    let hive_dir = Config::hive_dir()?;
    let plan = plan.map(Plan::load).transpose()?;
    hlog!(
        "Run command: repo={}, plan={}",
        repo.display(),
        plan.as_ref().map_or(0, |p| p.tasks.len())
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let workspaces = Arc::new(WorkspaceManager::from_config(repo, &config)?);
        let launcher = Arc::new(
            LocalLauncher::new()
                .with_log_dir(hive_dir.join("logs"))
                .with_inbox_dir(hive_dir.join("inbox")),
        );
        let probe = Arc::new(ProcProbe::new(repo.to_path_buf()));
        let (event_tx, mut event_rx) = mpsc::channel(256);

        let mut scheduler = Scheduler::new(config, workspaces, launcher, probe)
            .with_store(StateStore::new(Config::state_path()?))
            .with_inbox(Inbox::new(hive_dir.join("inbox")))
            .with_snapshot_path(Config::snapshot_path()?)
            .with_events(event_tx);

        let restored = scheduler.restore().await?;
        match (&plan, restored) {
            (None, false) => {
                return Err(Error::Validation("No saved state to resume".to_string()));
            }
            (Some(_), true) => {
                println!("Resuming saved state before submitting the plan");
            }
            _ => {}
        }
        if let Some(plan) = &plan {
            plan.submit(&mut *scheduler.graph().write().await)?;
        }

        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });
        let printer = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                print_event(&event);
            }
        });

        let snapshot = scheduler.run(cancel).await?;
        drop(scheduler);
        if let Err(e) = printer.await {
            hlog_warn!("Event printer ended abnormally: {}", e);
        }
        println!();
        println!("{}", snapshot.to_json()?);
        Ok(())
    })
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskStarted { task_id, worker_id } => {
            println!("  started    {} (worker {})", task_id, worker_id.short())
        }
        SchedulerEvent::TaskRestarting {
            task_id,
            attempt,
            delay,
        } => println!("  restarting {} (attempt {}, in {:?})", task_id, attempt, delay),
        SchedulerEvent::TaskCompleted { task_id, commit } => println!(
            "  completed  {} {}",
            task_id,
            commit.as_deref().map_or("", |c| &c[..c.len().min(8)])
        ),
        SchedulerEvent::TaskFailed { task_id, error } => {
            println!("  failed     {}: {}", task_id, error)
        }
        SchedulerEvent::TaskBlocked { task_id, reason } => {
            println!("  blocked    {}: {}", task_id, reason)
        }
        SchedulerEvent::AllTasksSettled => println!("All tasks settled"),
    }
}

fn run_check(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let (tasks, edges) = plan.into_records();
    let graph = GraphStore::restore(tasks, edges);
    let report = analyze(&graph, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_clear() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "plan has {} dependency cycle(s)",
            report.cycles.len()
        )))
    }
}

fn run_status() -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    match rt.block_on(Snapshot::read_from(&Config::snapshot_path()?))? {
        Some(snapshot) => println!("{}", snapshot.to_json()?),
        None => println!("No snapshot yet. Start a run with `hive run <plan>`."),
    }
    Ok(())
}

/// Apply an edit to the saved graph and write it back.
fn edit_saved_graph<F>(edit: F) -> Result<()>
where
    F: FnOnce(&mut GraphStore) -> Result<()>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = StateStore::new(Config::state_path()?);
        let mut state = store
            .load()
            .await?
            .ok_or_else(|| Error::Validation("No saved state".to_string()))?;
        let mut graph = GraphStore::restore(state.tasks, state.edges);
        edit(&mut graph)?;
        state.tasks = graph.all_tasks().into_iter().cloned().collect();
        state.edges = graph.edges();
        state.saved_at = chrono::Utc::now();
        store.save(&state).await
    })
}

/// Offline unblock. Retry counters live with the running scheduler, so a
/// resumed run starts them from zero anyway.
fn run_unblock(task: &str) -> Result<()> {
    let id = TaskId::from(task);
    edit_saved_graph(|graph| {
        let status = graph.unblock(&id)?;
        println!("{} is now {}", id, status.state());
        Ok(())
    })
}

fn run_archive(task: &str) -> Result<()> {
    let id = TaskId::from(task);
    edit_saved_graph(|graph| {
        graph.archive(&id)?;
        println!("{} archived", id);
        Ok(())
    })
}

fn run_cleanup(repo: &Path, delete: bool) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let workspaces = WorkspaceManager::from_config(repo, &config)?;
        let store = StateStore::new(Config::state_path()?);
        let state = store.load().await?;
        if let Some(state) = &state {
            workspaces.restore(state.workspaces.clone());
        }

        let merged: Vec<TaskId> = workspaces
            .list()
            .into_iter()
            .filter(|ws| ws.status == WorkspaceStatus::Merged)
            .map(|ws| ws.task_id)
            .collect();
        for task_id in &merged {
            match workspaces.cleanup(task_id).await {
                Ok(_) => println!("Cleaned workspace for {}", task_id),
                Err(e) => println!("Could not clean workspace for {}: {}", task_id, e),
            }
        }

        let report = if delete {
            workspaces.sweep_orphans().await?
        } else {
            workspaces.detect_orphans().await?
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !delete && report.orphan_count() > 0 {
            println!("Run `hive cleanup --delete` to remove {} orphan(s).", report.orphan_count());
        }

        if let Some(mut state) = state {
            if !merged.is_empty() {
                state.workspaces = workspaces.list();
                state.saved_at = chrono::Utc::now();
                store.save(&state).await?;
            }
        }
        Ok(())
    })
}
