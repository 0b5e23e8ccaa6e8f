//! observatory CLI: operator interface to the event history.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use observatory::config::Config;
use observatory::db::Db;
use observatory::history::History;
use observatory::hub::{Hub, SubscriptionFilter, Topic, TopicSet};
use observatory::lifecycle::Tracker;
use observatory::model::*;
use observatory::normalizer::Normalizer;
use observatory::store::{EventQuery, ExecutionQuery, MemoryStore};
use observatory::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use serde_json::json;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "observatory", about = "Event telemetry for orchestrated agent work")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Read event history
    Events {
        /// Only events of this execution
        #[arg(long)]
        execution: Option<String>,
        /// Only events after this sequence number
        #[arg(long)]
        after: Option<u64>,
        /// Filter by source (agent_run, chat, script, ...)
        #[arg(long)]
        source: Option<String>,
        /// Filter by category
        #[arg(long)]
        category: Option<String>,
        /// Filter by entry type
        #[arg(long)]
        entry_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Print raw JSON records
        #[arg(long)]
        json: bool,
    },
    /// Execution run operations
    Executions {
        #[command(subcommand)]
        action: ExecutionAction,
    },
    /// Run a sample execution in memory and print every delivered envelope
    Demo,
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions, newest first
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by work item
        #[arg(long)]
        work_item: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show an execution and its waves
    Show {
        /// Execution ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    match cli.command {
        Command::Demo => cmd_demo(&config).await,
        Command::Migrate => {
            let db = connect(&config).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Events {
            execution,
            after,
            source,
            category,
            entry_type,
            limit,
            offset,
            json,
        } => {
            let mut query = EventQuery::default().limit(limit).offset(offset);
            if let Some(id) = execution {
                query.execution_id = Some(ExecutionId::parse(&id)?);
            }
            if let Some(after) = after {
                query = query.after_sequence(after);
            }
            if let Some(source) = source {
                query = query.source(source.parse()?);
            }
            if let Some(category) = category {
                query = query.category(category.parse()?);
            }
            if let Some(entry_type) = entry_type {
                query = query.entry_type(entry_type);
            }
            let db = connect(&config).await?;
            cmd_events(History::new(db, Hub::new(config.hub())), query, json).await
        }
        Command::Executions { action } => {
            let db = connect(&config).await?;
            let history = History::new(db, Hub::new(config.hub()));
            match action {
                ExecutionAction::List {
                    status,
                    work_item,
                    limit,
                } => {
                    let query = ExecutionQuery {
                        status: status.map(|s| s.parse()).transpose()?,
                        work_item_id: work_item,
                        limit,
                        ..ExecutionQuery::default()
                    };
                    cmd_executions_list(&history, query).await
                }
                ExecutionAction::Show { id } => cmd_executions_show(&history, id).await,
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let url = config.require_database_url()?;
    let db = Db::connect(url.expose_secret())
        .await?
        .with_statement_timeout(config.statement_timeout());
    db.migrate().await?;
    Ok(db)
}

async fn cmd_events(history: History<Db>, query: EventQuery, json: bool) -> anyhow::Result<()> {
    let page = history.events(&query).await?;

    if page.items.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    if json {
        for record in &page.items {
            println!("{}", serde_json::to_string(record)?);
        }
    } else {
        println!(
            "{:<23}  {:<8}  {:>5}  {:<10}  {:<22}  SUMMARY",
            "TIME", "EXEC", "SEQ", "SOURCE", "TYPE"
        );
        println!("{}", "-".repeat(100));
        for record in &page.items {
            let exec = record
                .execution_id()
                .map(|id| id.to_string()[..8].to_string())
                .unwrap_or_else(|| "-".to_string());
            let seq = record
                .sequence
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<23}  {:<8}  {:>5}  {:<10}  {:<22}  {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                exec,
                seq,
                record.source,
                record.entry_type,
                record.summary
            );
        }
    }

    match page.next_offset {
        Some(next) => println!("\n{} event(s), more at --offset {next}", page.items.len()),
        None => println!("\n{} event(s)", page.items.len()),
    }
    Ok(())
}

async fn cmd_executions_list(history: &History<Db>, query: ExecutionQuery) -> anyhow::Result<()> {
    let page = history.executions(&query).await?;

    if page.items.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<10}  {:<11}  {:<6}  STARTED",
        "ID", "WORK ITEM", "STATUS", "TASKS", "WAVE"
    );
    println!("{}", "-".repeat(90));
    for run in &page.items {
        println!(
            "{:<8}  {:<24}  {:<10}  {:<11}  {:<6}  {}",
            &run.id.to_string()[..8],
            run.work_item_id,
            run.status,
            format!("{}/{} ({}✗)", run.completed_tasks, run.total_tasks, run.failed_tasks),
            format!("{}/{}", run.current_wave, run.total_waves),
            run.started_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} execution(s)", page.items.len());
    Ok(())
}

async fn cmd_executions_show(history: &History<Db>, id_str: String) -> anyhow::Result<()> {
    // Prefix match over the most recent executions
    let id = if id_str.len() < 36 {
        let recent = history
            .executions(&ExecutionQuery {
                limit: observatory::store::MAX_PAGE_SIZE,
                ..ExecutionQuery::default()
            })
            .await?;
        let matches: Vec<_> = recent
            .items
            .iter()
            .filter(|run| run.id.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no execution matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} executions match prefix '{id_str}', be more specific"),
        }
    } else {
        ExecutionId::parse(&id_str)?
    };

    let detail = history.execution(id).await?;
    let run = &detail.run;

    println!("ID:         {}", run.id);
    println!("Work Item:  {}", run.work_item_id);
    println!("Status:     {}", run.status);
    println!(
        "Tasks:      {} completed, {} failed, {} total",
        run.completed_tasks, run.failed_tasks, run.total_tasks
    );
    println!("Wave:       {}/{}", run.current_wave, run.total_waves);
    println!("Started:    {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed:  {completed}");
    }
    if let Some(ref error) = run.error {
        println!("Error:      {error}");
    }

    if !detail.waves.is_empty() {
        println!("---");
        for wave in &detail.waves {
            println!(
                "Wave {:<3} {:<12} {}/{} passed ({:.0}%){}",
                wave.wave_number,
                wave.status,
                wave.completed_count,
                wave.task_count,
                wave.pass_rate * 100.0,
                wave.duration_ms
                    .map(|ms| format!(", {ms}ms"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

/// Drive one two-wave execution against an in-memory store, printing the
/// envelopes a global subscriber and a late-joining execution subscriber see.
async fn cmd_demo(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let hub = Hub::new(config.hub());
    let normalizer = Normalizer::new(Arc::clone(&store), hub.clone(), config.normalizer());
    let tracker = Tracker::new(normalizer.clone());

    let (_live, mut live_rx) = hub.subscribe_unbounded(SubscriptionFilter::all());
    let shutdown = Arc::new(Notify::new());
    let heartbeat = hub.spawn_heartbeat(config.heartbeat_interval, Arc::clone(&shutdown));

    let execution_id = tracker.create_execution("demo-work-item", 4, 2).await;
    for (wave_number, tasks) in [(1u32, ["lint", "build"]), (2, ["test", "package"])] {
        let wave_id = tracker
            .start_wave(execution_id, wave_number, tasks.len() as u32)
            .await
            .applied()
            .ok_or_else(|| anyhow::anyhow!("wave {wave_number} was rejected"))?;

        for task in tasks {
            let context = AgentRunContext::new(execution_id)
                .task(task)
                .agent_instance(format!("agent-{task}"))
                .wave(wave_id, wave_number);
            normalizer
                .emit(
                    context.clone(),
                    EventPayload::new("tool_start", Category::Tool, format!("{task}: bash"))
                        .details(json!({ "tool_name": "bash", "task": task })),
                )
                .await;
            normalizer
                .emit(
                    context,
                    EventPayload::new("tool_end", Category::Tool, format!("{task}: ok"))
                        .details(json!({ "tool_name": "bash", "exit_code": 0 }))
                        .duration_ms(120),
                )
                .await;
        }

        let done = wave_number * 2;
        let _ = tracker.update_progress(execution_id, done, 0, wave_number).await;
        let _ = tracker.complete_wave(wave_id, 2, 0, 250).await;
    }
    let _ = tracker
        .complete_execution(execution_id, ExecutionStatus::Completed, None)
        .await;

    shutdown.notify_one();
    heartbeat.await?;

    println!("== live (all executions) ==");
    while let Ok(envelope) = live_rx.try_recv() {
        println!("{}", envelope.to_json()?);
    }

    println!("\n== late joiner (lifecycle topic, with replay) ==");
    let (_late, mut late_rx) = hub.subscribe_unbounded(
        SubscriptionFilter::execution(execution_id).topics(TopicSet::only([Topic::Lifecycle])),
    );
    while let Ok(envelope) = late_rx.try_recv() {
        println!("{}", envelope.to_json()?);
    }

    println!("\n{} record(s) stored", store.events().len());
    Ok(())
}
