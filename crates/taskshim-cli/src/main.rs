use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};
use taskshim_core::RuntimeConfig;

#[derive(Parser)]
#[command(name = "taskshim")]
#[command(author, version, about = "Task/shim supervision CLI", long_about = None)]
struct Cli {
    /// Target namespace
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,

    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task from an OCI-style bundle
    Create {
        /// Container/task ID
        id: String,

        /// Path to the bundle directory (must contain config.json)
        #[arg(short, long)]
        bundle: PathBuf,

        /// Runtime identifier, e.g. io.containerd.runc.v2
        #[arg(short, long)]
        runtime: String,
    },

    /// Start a created task
    Start {
        id: String,
    },

    /// Add and start an exec process inside a running task
    Exec {
        id: String,

        /// Exec process ID, unique within the task
        exec_id: String,

        /// Command to run, e.g. -- /bin/sh -c "echo hi"
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Send a signal to a task
    Kill {
        id: String,

        /// Signal number
        #[arg(short, long, default_value = "15")]
        signal: u32,

        /// Signal every process in the task, not just the init process
        #[arg(short, long)]
        all: bool,
    },

    /// Pause a running task
    Pause {
        id: String,
    },

    /// Resume a paused task
    Resume {
        id: String,
    },

    /// Delete a task and its bundle
    #[command(alias = "rm")]
    Delete {
        id: String,
    },

    /// List tasks in the namespace
    #[command(alias = "ps")]
    List,

    /// Show a task's current state
    State {
        id: String,
    },

    /// Show a task's resource stats
    Stats {
        id: String,
    },

    /// List a task's processes
    Pids {
        id: String,
    },

    /// Watch lifecycle events across all namespaces
    Events {
        /// Filter by container ID substring
        #[arg(short, long)]
        filter: Option<String>,
    },
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    if let Commands::Events { filter } = &cli.command {
        run_events(filter.clone()).await;
        return;
    }

    let config = RuntimeConfig::from_env();
    let service = match taskshim_core::bootstrap(&config).await {
        Ok(s) => s,
        Err(e) => fail(&e),
    };

    let namespace = cli.namespace;
    let result = match cli.command {
        Commands::Create { id, bundle, runtime } => {
            let spec = match std::fs::read(bundle.join("config.json")) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("{}: reading bundle config: {}", "Error".red().bold(), e);
                    std::process::exit(1);
                }
            };
            service
                .create(&namespace, &id, &runtime, &spec, None)
                .await
                .map(|pid| println!("{}: pid {}", "Created".green().bold(), pid))
        }
        Commands::Start { id } => service
            .start(&namespace, &id, None)
            .await
            .map(|pid| println!("{}: pid {}", "Started".green().bold(), pid)),
        Commands::Exec { id, exec_id, command } => {
            let request = taskshim_proto::ExecProcessRequest {
                id: id.clone(),
                exec_id: exec_id.clone(),
                terminal: false,
                stdin: String::new(),
                stdout: String::new(),
                stderr: String::new(),
                spec: serde_json::json!({ "args": command }).to_string(),
            };
            match service.exec(&namespace, &id, &exec_id, request).await {
                Ok(()) => service
                    .start(&namespace, &id, Some(&exec_id))
                    .await
                    .map(|pid| println!("{}: pid {}", "Exec started".green().bold(), pid)),
                Err(e) => Err(e),
            }
        }
        Commands::Kill { id, signal, all } => service
            .kill(&namespace, &id, None, signal, all)
            .await
            .map(|()| println!("{}", "Signal sent".green())),
        Commands::Pause { id } => service
            .pause(&namespace, &id)
            .await
            .map(|()| println!("{}", "Paused".green())),
        Commands::Resume { id } => service
            .resume(&namespace, &id)
            .await
            .map(|()| println!("{}", "Resumed".green())),
        Commands::Delete { id } => service
            .delete(&namespace, &id)
            .await
            .map(|()| println!("{}", "Deleted".green())),
        Commands::List => {
            let ids = service.list(&namespace).await;
            let rows: Vec<TaskRow> = ids.into_iter().map(|id| TaskRow { id }).collect();
            if rows.is_empty() {
                println!("No tasks found");
            } else {
                println!("{}", Table::new(rows));
            }
            Ok(())
        }
        Commands::State { id } => service
            .state(&namespace, &id, None)
            .await
            .map(|state| println!("{}", serde_json::to_string_pretty(&to_json(&state)).unwrap())),
        Commands::Stats { id } => service
            .stats(&namespace, &id)
            .await
            .map(|stats| match serde_json::from_str::<serde_json::Value>(&stats.stats) {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap()),
                Err(_) => println!("{}", stats.stats),
            }),
        Commands::Pids { id } => service.pids(&namespace, &id).await.map(|pids| {
            for p in pids.processes {
                println!("{}\t{}", p.pid, p.exec_id.unwrap_or_else(|| "-".to_string()));
            }
        }),
        Commands::Events { .. } => unreachable!("handled above"),
    };

    if let Err(e) = result {
        fail(&e);
    }
}

fn to_json(state: &taskshim_proto::StateResponse) -> serde_json::Value {
    serde_json::json!({
        "id": state.id,
        "bundle": state.bundle,
        "pid": state.pid,
        "status": format!("{:?}", state.status),
        "exitStatus": state.exit_status,
        "exitedAt": state.exited_at,
    })
}

async fn run_events(filter: Option<String>) {
    println!("{}", "Watching for events... (Ctrl+C to stop)".dimmed());
    let _ = ctrlc::set_handler(|| {
        println!("\n{}", "stopped watching".dimmed());
        std::process::exit(0);
    });
    let mut subscription = taskshim_core::events::global_exchange().subscribe();
    loop {
        let Some(envelope) = subscription.recv().await else {
            break;
        };
        if let Some(ref f) = filter {
            if envelope.payload.container_id().map(|c| c.contains(f.as_str())) != Some(true) {
                continue;
            }
        }
        println!(
            "{} {} {:?}",
            envelope.namespace.cyan(),
            envelope.topic,
            envelope.payload
        );
    }
}

fn fail(e: &taskshim_core::Error) -> ! {
    eprintln!("{}: {}", "Error".red().bold(), e);
    std::process::exit(1);
}
