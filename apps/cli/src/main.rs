use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use monky_core_sdk::{
    config::{HubConfig, DEFAULT_CONFIG_FILE},
    db::{self, ThreadStore},
    gateway::{FragmentSink, Gateway},
    models::{ChatRequest, PingReport},
    server, telemetry,
    workspace::{self, SqliteWorkspace},
};

/**
 * \brief CLI entry: chat with any configured provider, manage threads, run the hub.
 */
#[derive(Parser, Debug)]
#[command(name = "monky", version, about = "MONKY conversational gateway")]
struct Cli {
    /** \brief Hub configuration file. */
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Start the HTTP API and serve the UI.
     */
    Serve {
        /** \brief Overrides `server.host:server.port`. */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief Send one message and stream the reply.
     */
    Chat {
        #[arg(long, default_value = "local")]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        thread: Option<i64>,
        #[arg(long)]
        message: String,
    },

    #[command(subcommand)]
    Threads(ThreadCommand),

    /**
     * \brief Print a thread's messages (default: most recent thread).
     */
    Messages {
        #[arg(long)]
        thread: Option<i64>,
    },

    /**
     * \brief Readiness check for one provider, or all of them.
     */
    Ping { provider: Option<String> },

    Models { provider: String },

    Providers,
}

#[derive(Subcommand, Debug)]
enum ThreadCommand {
    List,
    Create {
        #[arg(long)]
        title: Option<String>,
    },
    Rename {
        id: i64,
        title: String,
    },
    Delete {
        id: i64,
    },
}

/** \brief Prints fragments as they arrive. */
struct StdoutSink;

impl FragmentSink for StdoutSink {
    fn fragment(&self, text: &str) -> bool {
        let mut out = std::io::stdout().lock();
        write!(out, "{}", text).and_then(|_| out.flush()).is_ok()
    }

    fn reset(&self) -> bool {
        println!();
        println!("--- provider failed mid-reply, answering locally ---");
        true
    }
}

fn print_ping(report: &PingReport) {
    println!(
        "{:<11} {:<4} {:>3} {:>6}ms  {}",
        report.provider,
        if report.ok { "ok" } else { "FAIL" },
        report.status,
        report.latency_ms,
        report.detail
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HubConfig::load(&cli.config).context("load config failed")?;
    let _log_guard = telemetry::init(&config.telemetry, &config.paths.log_dir)
        .context("init logging failed")?;

    if let Commands::Serve { addr: Some(addr) } = &cli.command {
        let (host, port) = addr
            .rsplit_once(':')
            .context("--addr must look like host:port")?;
        config.server.host = host.to_string();
        config.server.port = port.parse().context("invalid port in --addr")?;
    }

    let store = ThreadStore::open(&config.paths.db_path).context("open thread store failed")?;
    let ws_conn = db::open_db(&config.paths.db_path).context("open workspace failed")?;
    workspace::ensure_schema(&ws_conn).context("prepare workspace tables failed")?;
    let gateway = Gateway::new(config, store, Arc::new(SqliteWorkspace::new(ws_conn)))
        .context("start gateway failed")?;

    match cli.command {
        Commands::Serve { .. } => {
            gateway.recover().context("recover interrupted turns failed")?;
            server::run(gateway).await?;
        }
        Commands::Chat {
            provider,
            model,
            thread,
            message,
        } => {
            let mut request = ChatRequest::new(provider, message);
            if let Some(model) = model {
                request = request.with_model(model);
            }
            if let Some(thread) = thread {
                request = request.in_thread(thread);
            }
            let turn = gateway.begin(request).await?;
            let outcome = turn.run(&StdoutSink).await?;
            println!();
            for source in &outcome.sources {
                println!("  [{}] {}: {}", source.kind.as_str(), source.title, source.detail);
            }
            println!(
                "(thread {} | {} via {})",
                outcome.thread_id, outcome.model, outcome.provider_used
            );
        }
        Commands::Threads(cmd) => match cmd {
            ThreadCommand::List => {
                for t in gateway.list_threads()? {
                    println!("{:>5}  {}  {}", t.id, t.updated_at, t.title);
                }
            }
            ThreadCommand::Create { title } => {
                let t = gateway.create_thread(title.as_deref())?;
                println!("Created thread id={} ({})", t.id, t.title);
            }
            ThreadCommand::Rename { id, title } => {
                let t = gateway.rename_thread(id, &title)?;
                println!("Renamed thread id={} to {}", t.id, t.title);
            }
            ThreadCommand::Delete { id } => {
                gateway.delete_thread(id)?;
                println!("Deleted thread id={}", id);
            }
        },
        Commands::Messages { thread } => {
            let transcript = gateway.list_messages(thread)?;
            let Some(thread) = transcript.thread else {
                println!("No conversations yet.");
                return Ok(());
            };
            println!("# {} (id={})", thread.title, thread.id);
            for m in transcript.messages {
                println!("[{} {} via {}]", m.message.created_at, m.message.role.as_str(), m.message.provider);
                println!("{}", m.message.content);
                for s in m.sources {
                    println!("  [{}] {}: {}", s.kind.as_str(), s.title, s.detail);
                }
                println!();
            }
        }
        Commands::Ping { provider } => match provider {
            Some(id) => print_ping(&gateway.ping_provider(&id).await?),
            None => {
                for report in gateway.ping_all().await {
                    print_ping(&report);
                }
            }
        },
        Commands::Models { provider } => {
            let listing = gateway.list_models(&provider).await?;
            for m in &listing.models {
                println!("{}", m.id);
            }
            if let Some(warning) = listing.warning {
                eprintln!("warning: {}", warning);
            }
        }
        Commands::Providers => {
            let config = gateway.config();
            for p in gateway.list_providers() {
                let state = match config.credential(p) {
                    Ok(_) => "ready",
                    Err(_) => "no credential",
                };
                println!(
                    "{:<11} {:<22} model={:<28} {}",
                    p.id,
                    p.label,
                    config.model_for(p, None),
                    state
                );
            }
        }
    }

    Ok(())
}
