#![forbid(unsafe_code)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::agent::BackendKind;
use crate::config::{self, Config};
use crate::core::git::Git;
use crate::core::workspace::WorkspaceManager;
use crate::orchestrator::Orchestrator;
use crate::output::table::Table;
use crate::task::model::{NewTask, Role, Task, TaskStatus, parse_rfc3339};
use crate::task::storage::JsonStore;
use crate::task::store::{Store, prefs};

const LOG_ENV: &str = "AGENT_ORCH_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "agent-orch",
    version,
    about = "Run coding agents in isolated git worktrees"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a task without starting it
    New(NewArgs),
    /// Create a task, start it and wait for the first turn
    Run(RunArgs),
    /// Start (or resume) a task
    Start(StartArgs),
    /// Send a follow-up message to a task
    Send(SendArgs),
    /// Cancel a task
    Stop(TaskRef),
    /// Mark a task completed
    Complete(TaskRef),
    #[command(alias = "ls")]
    List(ListArgs),
    Show(ShowArgs),
    #[command(alias = "rm")]
    Delete(TaskRef),
    Workspace(WorkspaceArgs),
    #[command(alias = "prefs")]
    Pref(PrefArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct NewArgs {
    /// What the agent should do
    pub prompt: String,
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    /// claude or codex
    #[arg(short = 'b', long = "backend")]
    pub backend: Option<String>,
    /// Branch the workspace starts from
    #[arg(long = "base")]
    pub base: Option<String>,
    /// Keep the workspace when the task is deleted
    #[arg(long = "retain-workspace")]
    pub retain_workspace: bool,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    #[command(flatten)]
    pub task: NewArgs,
    /// Print assistant messages as JSON
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StartArgs {
    /// Task id, id prefix or name
    pub task: String,
    #[arg(short = 'b', long = "backend")]
    pub backend: Option<String>,
    /// Return once the turn is dispatched
    #[arg(long = "no-wait")]
    pub no_wait: bool,
}

#[derive(Debug, Parser)]
pub struct SendArgs {
    pub task: String,
    pub text: String,
    #[arg(long = "no-wait")]
    pub no_wait: bool,
}

#[derive(Debug, Parser)]
pub struct TaskRef {
    /// Task id, id prefix or name
    pub task: String,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Only tasks with this status
    #[arg(long = "status")]
    pub status: Option<String>,
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json", conflicts_with = "csv")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    pub task: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct WorkspaceArgs {
    #[command(subcommand)]
    pub cmd: WorkspaceCmd,
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCmd {
    /// Print the workspace directory of a task
    Find(TaskRef),
    /// List git worktrees of the repository
    List,
}

#[derive(Debug, Parser)]
pub struct PrefArgs {
    #[command(subcommand)]
    pub cmd: PrefCmd,
}

#[derive(Debug, Subcommand)]
pub enum PrefCmd {
    Get(KeyArg),
    Set(KeyValueArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Get(KeyArg),
    Set(KeyValueArgs),
}

#[derive(Debug, Parser)]
pub struct KeyArg {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct KeyValueArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "agent-orch", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => Ok(cmd_version()),
        Commands::Config(args) => cmd_config(args),
        cmd => {
            let cfg = load_cfg().await?;
            let orch = build_orchestrator(&cfg)?;
            dispatch(&orch, cmd).await
        }
    }
}

async fn dispatch(orch: &Orchestrator, cmd: Commands) -> anyhow::Result<ExitCode> {
    match cmd {
        Commands::New(args) => {
            let task = orch.create_task(new_task(args))?;
            println!("{}", task.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            let task = orch.create_task(new_task(args.task))?;
            eprintln!("Created task {} ({})", task.short_id(), task.backend);
            orch.start(&task.id, None).await?;
            finish_turn(orch, &task.id, args.json).await
        }
        Commands::Start(args) => {
            let task = find_task(orch.store().as_ref(), &args.task)?;
            let backend = args
                .backend
                .as_deref()
                .map(str::parse::<BackendKind>)
                .transpose()?;
            orch.start(&task.id, backend).await?;
            if args.no_wait {
                return Ok(ExitCode::SUCCESS);
            }
            finish_turn(orch, &task.id, false).await
        }
        Commands::Send(args) => {
            let task = find_task(orch.store().as_ref(), &args.task)?;
            orch.send_message(&task.id, &args.text).await?;
            if args.no_wait {
                return Ok(ExitCode::SUCCESS);
            }
            finish_turn(orch, &task.id, false).await
        }
        Commands::Stop(args) => {
            let task = find_task(orch.store().as_ref(), &args.task)?;
            let task = orch.stop(&task.id)?;
            println!("Cancelled {} after {}", task.short_id(), duration_string(&task));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Complete(args) => {
            let task = find_task(orch.store().as_ref(), &args.task)?;
            let task = orch.complete(&task.id)?;
            println!("Completed {} after {}", task.short_id(), duration_string(&task));
            Ok(ExitCode::SUCCESS)
        }
        Commands::List(args) => {
            cmd_list(orch.store().as_ref(), &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Show(args) => {
            cmd_show(orch.store().as_ref(), &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Delete(args) => {
            let task = find_task(orch.store().as_ref(), &args.task)?;
            orch.delete(&task.id).await?;
            println!("Deleted {}", task.short_id());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Workspace(args) => cmd_workspace(orch, args),
        Commands::Pref(args) => cmd_pref(orch.store().as_ref(), args),
        Commands::Completion(_) | Commands::Version | Commands::Config(_) => Ok(ExitCode::SUCCESS),
    }
}

async fn load_cfg() -> anyhow::Result<Config> {
    let (cfg, _paths) = tokio::task::spawn_blocking(config::load).await??;
    Ok(cfg)
}

fn build_orchestrator(cfg: &Config) -> anyhow::Result<Orchestrator> {
    let git = if cfg.workspace.repository.trim().is_empty() {
        Git::from_cwd()?
    } else {
        let dir = config::expand_path(&cfg.workspace.repository)?;
        Git::from_dir(&dir)
            .with_context(|| format!("not a git repository: {}", cfg.workspace.repository))?
    };
    let store = JsonStore::new(cfg.data_dir()?);
    store.ensure_dir()?;
    let workspaces = WorkspaceManager::new(git, cfg.workspace_root()?);
    Ok(Orchestrator::new(cfg.clone(), Arc::new(store), workspaces))
}

fn new_task(args: NewArgs) -> NewTask {
    NewTask {
        name: args.name,
        prompt: args.prompt,
        base_branch: args.base,
        backend: args.backend,
        skill_id: None,
        retain_workspace: args.retain_workspace,
    }
}

/// Wait for the dispatched turn, printing the reply. Ctrl-C cancels the task.
async fn finish_turn(orch: &Orchestrator, task_id: &str, json: bool) -> anyhow::Result<ExitCode> {
    let task = tokio::select! {
        task = orch.wait_idle(task_id) => task?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted; cancelling task");
            orch.stop(task_id)?
        }
    };

    let messages = orch.store().get_messages_for_task(task_id)?;
    let reply = messages.iter().rev().find(|m| m.role == Role::Assistant);
    if json {
        let mut s = serde_json::to_string_pretty(&serde_json::json!({
            "task": task,
            "reply": reply,
        }))?;
        s.push('\n');
        print!("{s}");
    } else if let Some(reply) = reply {
        println!("{}", reply.content);
    }

    match task.status {
        TaskStatus::Failed => {
            if let Some(err) = task.last_error.as_deref() {
                eprintln!("Task {} failed: {err}", task.short_id());
            }
            Ok(ExitCode::from(1))
        }
        TaskStatus::Cancelled => Ok(ExitCode::from(130)),
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn cmd_list(store: &dyn Store, args: &ListArgs) -> anyhow::Result<()> {
    let mut tasks = store.get_all_tasks()?;
    if let Some(status) = args.status.as_deref() {
        let wanted = status.trim().to_ascii_lowercase();
        tasks.retain(|t| t.status.as_str() == wanted);
    }

    if args.json {
        let mut s = serde_json::to_string_pretty(&tasks)?;
        s.push('\n');
        print!("{s}");
        return Ok(());
    }

    if args.csv {
        let mut t = Table::new([
            "task_id", "name", "status", "backend", "ready", "progress", "workspace", "duration",
        ]);
        for task in &tasks {
            t.row([
                task.id.clone(),
                task.name.clone().unwrap_or_default(),
                task.status.as_str().to_owned(),
                task.backend.clone(),
                task.ready_to_act.to_string(),
                task.progress_percent.to_string(),
                task.workspace_path.clone(),
                duration_string(task),
            ]);
        }
        t.write_csv()?;
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let mut t = if args.verbose {
        Table::new([
            "TASK", "STATUS", "BACKEND", "PROGRESS", "DURATION", "WORKSPACE", "NAME",
        ])
    } else {
        Table::new(["TASK", "STATUS", "BACKEND", "PROGRESS", "DURATION", "NAME"])
    };
    for task in &tasks {
        let mut row = vec![
            task.short_id(),
            status_label(task),
            task.backend.clone(),
            progress_string(task),
            duration_string(task),
        ];
        if args.verbose {
            row.push(if task.workspace_path.is_empty() {
                "-".to_owned()
            } else {
                task.workspace_path.clone()
            });
        }
        row.push(truncate(&task.display_name(), 50));
        t.row(row);
    }
    t.print()?;
    Ok(())
}

fn cmd_show(store: &dyn Store, args: &ShowArgs) -> anyhow::Result<()> {
    let task = find_task(store, &args.task)?;
    let messages = store.get_messages_for_task(&task.id)?;

    if args.json {
        let mut s = serde_json::to_string_pretty(&serde_json::json!({
            "task": task,
            "messages": messages,
        }))?;
        s.push('\n');
        print!("{s}");
        return Ok(());
    }

    println!("Task: {} (ID: {})", task.display_name(), task.id);
    println!("Status: {}", status_label(&task));
    println!("Phase: {}", task.phase.as_str());
    println!("Backend: {}", task.backend);
    if !task.base_branch.is_empty() {
        println!("Base: {}", task.base_branch);
    }
    if !task.workspace_path.is_empty() {
        println!("Workspace: {}", task.workspace_path);
    }
    if let Some(session) = task.session_id.as_deref() {
        println!("Session: {session}");
    }
    if task.total_subtasks > 0 {
        println!("Progress: {}", progress_string(&task));
    }
    println!("Created: {}", task.created_at);
    if let Some(done) = task.completed_at.as_deref() {
        println!("Finished: {done} ({})", duration_string(&task));
    }
    if let Some(err) = task.last_error.as_deref()
        && !err.trim().is_empty()
    {
        println!("\nLast Error:\n{err}");
    }

    if !task.prompt.trim().is_empty() {
        println!("\nPrompt:\n{}", task.prompt);
    }
    for m in &messages {
        let who = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        println!("\n[{who} {}]\n{}", m.created_at, m.content);
    }
    Ok(())
}

fn cmd_workspace(orch: &Orchestrator, args: WorkspaceArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        WorkspaceCmd::Find(r) => {
            let task = find_task(orch.store().as_ref(), &r.task)?;
            match orch.workspaces().resolve(&task.workspace_path, &task.id) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("No workspace found for task {}", task.short_id());
                    Ok(ExitCode::from(1))
                }
            }
        }
        WorkspaceCmd::List => {
            let entries = orch.workspaces().list()?;
            let mut t = Table::new(["BRANCH", "HEAD", "PATH"]);
            for e in entries {
                t.row([
                    if e.branch.is_empty() {
                        "(detached)".to_owned()
                    } else {
                        e.branch
                    },
                    e.head.chars().take(8).collect(),
                    e.path.display().to_string(),
                ]);
            }
            t.print()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_pref(store: &dyn Store, args: PrefArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        PrefCmd::Get(get) => match store.get_preference(&get.key)? {
            Some(v) => {
                println!("{v}");
                Ok(ExitCode::SUCCESS)
            }
            None => Ok(ExitCode::from(1)),
        },
        PrefCmd::Set(set) => {
            if set.key == prefs::DEFAULT_BACKEND {
                set.value.parse::<BackendKind>()?;
            }
            store.set_preference(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => {
            print!("{}", config::list_resolved_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        ConfigCmd::Set(set) => {
            config::set_value_string(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
            Ok(ExitCode::SUCCESS)
        }
        ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
            Some(v) => {
                println!("{v}");
                Ok(ExitCode::SUCCESS)
            }
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'agent-orch config list' to see available keys",
                get.key
            ),
        },
    }
}

/// Exact id, then unique id prefix, then unique name substring.
fn find_task(store: &dyn Store, pattern: &str) -> anyhow::Result<Task> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        anyhow::bail!("task id is required");
    }
    if !pattern.contains(['/', '\\']) && !pattern.contains("..")
        && let Some(task) = store.get_task(pattern)?
    {
        return Ok(task);
    }

    let tasks = store.get_all_tasks()?;
    let mut matches: Vec<Task> = tasks
        .iter()
        .filter(|t| t.id.starts_with(pattern))
        .cloned()
        .collect();
    if matches.is_empty() {
        let p = pattern.to_lowercase();
        matches = tasks
            .into_iter()
            .filter(|t| t.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&p)))
            .collect();
    }

    match matches.len() {
        0 => anyhow::bail!("no task found matching: {pattern}"),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("{n} tasks match '{pattern}'; use a longer id"),
    }
}

fn status_label(task: &Task) -> String {
    match task.status {
        TaskStatus::Running if task.ready_to_act => "ready".to_owned(),
        s => s.as_str().to_owned(),
    }
}

fn progress_string(task: &Task) -> String {
    if task.total_subtasks == 0 {
        return "-".to_owned();
    }
    format!(
        "{}/{} ({}%)",
        task.completed_subtasks, task.total_subtasks, task.progress_percent
    )
}

fn duration_string(task: &Task) -> String {
    if let Some(ms) = task.duration_ms {
        return format_duration(time::Duration::milliseconds(
            i64::try_from(ms).unwrap_or(i64::MAX),
        ));
    }
    match parse_rfc3339(&task.created_at) {
        Some(start) if task.status == TaskStatus::Running => {
            format_duration(time::OffsetDateTime::now_utc() - start)
        }
        _ => "-".to_owned(),
    }
}

fn format_duration(d: time::Duration) -> String {
    if d < time::Duration::minutes(1) {
        return format!("{}s", d.whole_seconds().max(0));
    }
    if d < time::Duration::hours(1) {
        return format!("{}m", d.whole_minutes());
    }
    let hours = d.whole_hours();
    let minutes = (d - time::Duration::hours(hours)).whole_minutes();
    format!("{hours}h {minutes}m")
}

fn cmd_version() -> ExitCode {
    println!("agent-orch version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

fn truncate(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::store::MemoryStore;

    #[test]
    fn find_task_by_prefix_and_name() {
        let store = MemoryStore::new();
        let a = store
            .create_task(Task::new(NewTask {
                name: Some("Health endpoint".to_owned()),
                ..NewTask::default()
            }))
            .unwrap();
        store.create_task(Task::new(NewTask::default())).unwrap();

        assert_eq!(find_task(&store, &a.id).unwrap().id, a.id);
        assert_eq!(find_task(&store, &a.id[..12]).unwrap().id, a.id);
        assert_eq!(find_task(&store, "health").unwrap().id, a.id);
        assert!(find_task(&store, "nothing-like-this").is_err());
        assert!(find_task(&store, "").is_err());
    }

    #[test]
    fn durations_format_compactly() {
        assert_eq!(format_duration(time::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(time::Duration::minutes(5)), "5m");
        assert_eq!(format_duration(time::Duration::minutes(135)), "2h 15m");
    }

    #[test]
    fn cli_parses_core_commands() {
        let cli = Cli::try_parse_from(["agent-orch", "send", "3f9a", "also add a test"]).unwrap();
        assert!(matches!(cli.cmd, Commands::Send(ref a) if a.text == "also add a test"));
        let cli = Cli::try_parse_from(["agent-orch", "run", "-b", "codex", "fix it"]).unwrap();
        assert!(matches!(cli.cmd, Commands::Run(ref a) if a.task.backend.as_deref() == Some("codex")));
        Cli::command().debug_assert();
    }
}
