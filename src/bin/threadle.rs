//! threadle CLI: run shell commands with bounded concurrency and retries.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::process::Command as Shell;
use std::sync::Arc;
use std::time::Duration;
use threadle::config::Config;
use threadle::telemetry::{TelemetryConfig, init_telemetry};
use threadle::{Engine, KeyedMutexes, TaskHandle, Threads};

#[derive(Parser)]
#[command(name = "threadle", about = "Bounded task execution with retries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run shell commands as tasks.
    ///
    /// A command written as `@KEY:COMMAND` holds the lock for KEY while it
    /// runs, so commands sharing a key never overlap.
    Run {
        /// Threads: negative for unbounded, 0 to run inline, positive for fixed
        #[arg(long, allow_hyphen_values = true)]
        threads: Option<i64>,
        /// Retry budget per command
        #[arg(long)]
        retries: Option<u32>,
        /// Maximum commands waiting for a thread
        #[arg(long)]
        max_queued: Option<usize>,
        /// Maximum commands running at once
        #[arg(long)]
        permits: Option<usize>,
        /// Stop waiting for outstanding commands after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Commands to run; read from stdin (one per line) when omitted
        commands: Vec<String>,
    },
    /// Print the configuration resolved from the environment
    Config,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run {
            threads,
            retries,
            max_queued,
            permits,
            timeout_secs,
            commands,
        } => {
            let mut engine_config = config.engine.clone();
            if let Some(threads) = threads {
                engine_config.threads = Threads::from(threads);
            }
            if let Some(retries) = retries {
                engine_config.retries = retries;
            }
            if let Some(max_queued) = max_queued {
                engine_config.max_queued = max_queued;
            }

            // Hosts the OTLP exporters; tasks run on the engine's own pool.
            let runtime = tokio::runtime::Runtime::new()?;
            let _context = runtime.enter();
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "threadle".to_string(),
                log_level: config.log_level.clone(),
            })?;

            let commands = if commands.is_empty() {
                read_stdin_commands()?
            } else {
                commands
            };
            let engine = Engine::from_config(&engine_config)?;
            cmd_run(&engine, permits, timeout_secs, commands)
        }
        Command::Config => cmd_config(&config),
    }
}

fn read_stdin_commands() -> anyhow::Result<Vec<String>> {
    let mut commands = Vec::new();
    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading commands from stdin")?;
        if !line.trim().is_empty() {
            commands.push(line);
        }
    }
    Ok(commands)
}

/// A shell command, optionally tied to a lock key.
#[derive(Debug, Clone)]
struct ShellTask {
    key: Option<String>,
    command: String,
}

impl ShellTask {
    fn parse(line: &str) -> Self {
        if let Some(rest) = line.strip_prefix('@') {
            if let Some((key, command)) = rest.split_once(':') {
                return Self {
                    key: Some(key.trim().to_string()),
                    command: command.trim().to_string(),
                };
            }
        }
        Self {
            key: None,
            command: line.trim().to_string(),
        }
    }

    fn run(&self, locks: &KeyedMutexes<String>) -> anyhow::Result<String> {
        let _held = self.key.as_ref().map(|key| locks.acquire(key.clone()));
        let output = Shell::new("sh").arg("-c").arg(&self.command).output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            anyhow::bail!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim_end()
            )
        }
    }
}

fn cmd_run(
    engine: &Engine,
    permits: Option<usize>,
    timeout_secs: Option<u64>,
    commands: Vec<String>,
) -> anyhow::Result<()> {
    if commands.is_empty() {
        println!("No commands to run.");
        return Ok(());
    }

    let locks = Arc::new(KeyedMutexes::<String>::new());
    let needle = permits.map(|p| engine.needle_with(p)).transpose()?;

    let mut handles: Vec<(String, TaskHandle<String>)> = Vec::with_capacity(commands.len());
    for (index, line) in commands.iter().enumerate() {
        let task = ShellTask::parse(line);
        let name = format!("#{index} {}", task.command);
        let locks = Arc::clone(&locks);
        let work = move || task.run(&locks);
        let handle = match &needle {
            Some(needle) => needle.submit(&name, work)?,
            None => engine.submit(&name, work)?,
        };
        handles.push((name, handle));
    }

    let drained = match timeout_secs {
        Some(secs) => engine.close_timeout(Duration::from_secs(secs)),
        None => engine.close(),
    };
    if !drained {
        anyhow::bail!(
            "timed out with {} command(s) still running",
            engine.remaining()
        );
    }

    let total = handles.len();
    let mut failed = 0;
    for (name, handle) in handles {
        match handle.wait_final() {
            Ok(stdout) => {
                println!("ok      {name}");
                if !stdout.is_empty() {
                    println!("{stdout}");
                }
            }
            Err(e) => {
                failed += 1;
                println!("failed  {name}: {e}");
            }
        }
    }

    println!("\n{} of {total} command(s) succeeded", total - failed);
    if failed > 0 {
        anyhow::bail!("{failed} command(s) failed");
    }
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    let engine = &config.engine;
    println!("Threads:        {}", engine.threads);
    println!("Daemon:         {}", engine.daemon);
    println!("Retries:        {}", engine.retries);
    println!("Max Queued:     {}", engine.max_queued);
    println!("Needle Permits: {}", engine.needle_permits);
    println!(
        "OTLP Endpoint:  {}",
        config.otel_endpoint.as_deref().unwrap_or("-")
    );
    println!("Log Level:      {}", config.log_level);
    Ok(())
}
