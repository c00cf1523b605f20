mod agent;
mod assistant;
mod cache;
mod config;
mod llm;
mod logging;
mod resilience;
mod scheduler;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::agent::LoopEvent;
use crate::assistant::{Assistant, ReplySource, TurnReply, scheduled_session_id};
use crate::cache::PromptCacheManager;
use crate::config::AppConfig;
use crate::llm::HttpBackend;
use crate::scheduler::{TaskScheduler, TaskStore};

const CLI_SESSION: &str = "cli";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "amira",
    version,
    about = "Home automation assistant with provider fallback and scheduled tasks"
)]
pub struct Cli {
    /// Comma separated provider order, e.g. "anthropic,openai"
    #[arg(long)]
    providers: Option<String>,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Scheduled task store (JSON)
    #[arg(long)]
    tasks_file: Option<PathBuf>,

    /// Do not start the background scheduler
    #[arg(long, action = ArgAction::SetTrue)]
    no_scheduler: bool,
}

fn print_help() {
    println!(
        "/help            Show help\n/stats           Provider fallback statistics\n/tasks           Scheduler statistics and tasks\n/history <id>    Recent runs of a task\n/cache           Cache statistics\n/cache clear     Drop all semantic cache entries\n/intent <name>   Tag following turns with an intent (none to unset)\n/quit            Quit\nCtrl-C aborts the running turn."
    );
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("[error] {e}"),
    }
}

/// Returns `true` when the loop should quit.
fn handle_command(line: &str, assistant: &Assistant, intent: &mut Option<String>) -> bool {
    let (cmd, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match cmd {
        "/help" => print_help(),
        "/quit" | "/exit" => return true,
        "/stats" => print_json(&assistant.chain().stats()),
        "/tasks" => print_json(&assistant.scheduler().stats()),
        "/history" if !arg.is_empty() => print_json(&assistant.scheduler().task_history(arg, 10)),
        "/history" => println!("usage: /history <task_id>"),
        "/cache" if arg == "clear" => {
            assistant.semantic_cache().clear();
            println!("semantic cache cleared");
        }
        "/cache" => {
            print_json(&assistant.semantic_cache().stats());
            print_json(&assistant.prompt_cache().stats());
        }
        "/intent" => {
            *intent = (!arg.is_empty() && arg != "none").then(|| arg.to_string());
            println!("intent: {}", intent.as_deref().unwrap_or("-"));
        }
        other => println!("unknown command: {other} (try /help)"),
    }
    false
}

fn spawn_event_printer() -> mpsc::UnboundedSender<LoopEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel::<LoopEvent>();
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                LoopEvent::Status(s) => eprintln!("[status] {s}"),
                LoopEvent::Tool { description, .. } => eprintln!("[tool] {description}"),
                LoopEvent::Clear => {}
                LoopEvent::Token(s) => println!("{s}"),
                LoopEvent::Error(e) => eprintln!("[error] {e}"),
                LoopEvent::Done { outcome, .. } => {
                    eprintln!("[done] {}", outcome.as_str());
                }
            }
        }
    });
    tx
}

fn log_reply(session_id: &str, reply: &TurnReply) {
    match &reply.source {
        ReplySource::Cache { similarity } => {
            info!(session_id, similarity, "turn served from cache");
        }
        ReplySource::Model(report) => info!(
            session_id,
            outcome = report.outcome.as_str(),
            provider = report.provider.as_deref().unwrap_or("-"),
            rounds = report.rounds,
            cost_usd = report.cost_usd,
            "turn finished"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let cfg = AppConfig::from_cli(&cli)?;
    logging::init_logging(&cfg.log_level, cfg.log_file.as_deref())?;
    info!(providers = ?cfg.provider_order, "app config");

    let prompt_cache = Arc::new(PromptCacheManager::new(cfg.cache.prompt_caching));
    let backend = Arc::new(HttpBackend::from_config(&cfg, prompt_cache.clone())?);

    let (sched_tx, mut sched_rx) = mpsc::unbounded_channel::<(String, String)>();
    let scheduler = Arc::new(
        TaskScheduler::new(Duration::from_secs(cfg.scheduler.check_interval_secs))
            .with_store(TaskStore::new(&cfg.scheduler.tasks_file))
            .with_message_sink(Arc::new(sched_tx)),
    );
    let assistant = Assistant::new(&cfg, backend, scheduler.clone(), prompt_cache)
        .context("build assistant")?;
    match scheduler.load_tasks() {
        Ok(n) => info!(loaded = n, file = %cfg.scheduler.tasks_file.display(), "scheduled tasks loaded"),
        Err(e) => warn!(error = %e, "could not load scheduled tasks"),
    }
    if cfg.scheduler.enabled {
        scheduler.start();
    }

    let events = spawn_event_printer();
    let mut intent: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("amira - type /help for commands");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.starts_with('/') {
                    if handle_command(line, &assistant, &mut intent) {
                        break;
                    }
                    continue;
                }
                let turn = assistant.handle_turn(CLI_SESSION, line, intent.as_deref(), Some(&events));
                tokio::pin!(turn);
                let reply = loop {
                    tokio::select! {
                        reply = &mut turn => break reply,
                        _ = tokio::signal::ctrl_c() => {
                            info!("abort requested");
                            assistant.aborts().request(CLI_SESSION);
                        }
                    }
                };
                log_reply(CLI_SESSION, &reply);
            }
            Some((task_id, message)) = sched_rx.recv() => {
                eprintln!("[scheduled] {task_id}: {message}");
                let session_id = scheduled_session_id(&task_id);
                let turn = assistant.handle_scheduled(&task_id, &message, Some(&events));
                tokio::pin!(turn);
                let reply = loop {
                    tokio::select! {
                        reply = &mut turn => break reply,
                        _ = tokio::signal::ctrl_c() => {
                            info!(task_id = %task_id, "abort requested");
                            assistant.aborts().request(&session_id);
                        }
                    }
                };
                log_reply(&session_id, &reply);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    scheduler.stop().await;
    if let Err(e) = scheduler.save_tasks() {
        error!(error = %e, "could not save scheduled tasks");
    }
    info!("bye");
    Ok(())
}
