use filexfer::bench::{self, report, BenchmarkStats, Harness, Ledger, Selection};
use filexfer::client::Client;
use filexfer::config::{Action, ClientSettings, Config};
use filexfer::server::{prefork, Server, ServerOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error>;

fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries reports and worker results
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config.action))
}

async fn run(action: Action) -> Result<(), BoxError> {
    match action {
        Action::Serve(options) => serve(options).await,
        Action::List(settings) => list(&settings).await,
        Action::Download {
            settings,
            selection,
        } => {
            let selection: Selection = selection.parse()?;
            let stats = harness(&settings)
                .download(&selection, interrupted())
                .await?;
            finish(&settings, &stats)
        }
        Action::Upload { settings, size_mb } => {
            let stats = harness(&settings).upload(size_mb, interrupted()).await?;
            finish(&settings, &stats)
        }
        Action::Delete { settings, filename } => {
            let message = harness(&settings).delete(&filename).await?;
            println!("{}", message);
            Ok(())
        }
        Action::Worker(args) => {
            let outcome = bench::run_worker(&args).await;
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(())
        }
        Action::ServeWorker(args) => Ok(prefork::serve_worker(args).await?),
    }
}

async fn serve(options: ServerOptions) -> Result<(), BoxError> {
    info!(
        listen = %options.listen,
        workers = options.workers,
        executor = %options.executor,
        storage_dir = %options.storage_dir.display(),
        "Starting filexfer server"
    );
    let server = Server::bind(options).await?;
    server.run(interrupted()).await;
    Ok(())
}

async fn list(settings: &ClientSettings) -> Result<(), BoxError> {
    let files = harness(settings).list().await?;
    if files.is_empty() {
        println!("No files on server.");
    } else {
        println!("\nFiles:");
        for (i, name) in files.iter().enumerate() {
            println!("{}. {}", i + 1, name);
        }
    }
    Ok(())
}

fn harness(settings: &ClientSettings) -> Harness {
    let client = Client::new(settings.server.clone(), settings.timeout)
        .with_max_frame_size(settings.max_frame_size);
    Harness::new(client, settings.harness.clone())
}

fn finish(settings: &ClientSettings, stats: &BenchmarkStats) -> Result<(), BoxError> {
    print!("{}", report::summary(stats));
    let ledger = Ledger::new(&settings.ledger);
    ledger.append(stats)?;
    info!(ledger = %ledger.path().display(), "Results saved");
    Ok(())
}

/// Resolves on ctrl-c.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
    info!("Interrupt received");
}
