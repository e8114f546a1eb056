use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use floodgate_core::conduit::conduit;
use floodgate_core::config::EngineConfig;
use floodgate_core::execution::{ExecutionService, JobExecution};
use floodgate_core::processor::{CollectSink, CountPerKey, ListSource, ProcessorContext};
use floodgate_core::snapshot::InMemorySnapshotStore;
use floodgate_core::tasklet::{ProcessorTasklet, Tasklet};
use floodgate_core::types::{ExecutionId, JobId, ProcessingGuarantee, SnapshotId};
use tracing_subscriber::EnvFilter;

const TEXT: &str = "the quick brown fox jumps over the lazy dog while the dog sleeps";

#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(about = "Floodgate local job runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count words of a generated text, taking snapshots while the job runs.
    Wordcount {
        #[arg(long, default_value_t = 100_000)]
        words: usize,
        #[arg(long, default_value = "exactly-once")]
        guarantee: ProcessingGuarantee,
        #[arg(long, default_value_t = 10)]
        snapshot_interval_ms: u64,
        #[arg(long, default_value_t = 2)]
        threads: usize,
        /// Words the source emits per call.
        #[arg(long, default_value_t = 64)]
        batch: usize,
        /// Print the counts of every word.
        #[arg(long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Wordcount {
            words,
            guarantee,
            snapshot_interval_ms,
            threads,
            batch,
            verbose,
        } => {
            let config = EngineConfig {
                cooperative_thread_count: threads,
                ..EngineConfig::default()
            };
            let service = ExecutionService::new(config.clone());
            let store = InMemorySnapshotStore::new();
            let results = Arc::new(Mutex::new(Vec::new()));

            let mut job = JobExecution::new(JobId(1), ExecutionId(1), guarantee);
            let tasklets = wordcount_job(&job, &config, words, batch, &store, results.clone());
            job.start(&service, tasklets)?;

            let taken = if guarantee.snapshotting_enabled() {
                drive_snapshots(&job, Duration::from_millis(snapshot_interval_ms)).await?
            } else {
                0
            };
            tokio::task::spawn_blocking(move || job.join()).await??;

            let mut counts = results
                .lock()
                .map_err(|_| anyhow::anyhow!("results lock poisoned"))?
                .clone();
            counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            let total: u64 = counts.iter().map(|(_, c)| c).sum();
            println!(
                "wordcount: words={} distinct={} snapshots={} stored={:?}",
                total,
                counts.len(),
                taken,
                store.snapshot_ids()?
            );
            if verbose {
                for (word, count) in counts {
                    println!("{word:>10} {count}");
                }
            }
        }
    }
    Ok(())
}

/// Start a snapshot every `interval` until the job finishes, like a coordinator
/// would. Returns the number of completed snapshots.
async fn drive_snapshots(job: &JobExecution, interval: Duration) -> anyhow::Result<SnapshotId> {
    let mut ticker = tokio::time::interval(interval);
    let mut next_id: SnapshotId = 0;
    while !job.is_finished() {
        ticker.tick().await;
        let mut completion = job.start_snapshot(next_id)?;
        // A failed job never resolves the completion; stop waiting once it is gone.
        loop {
            tokio::select! {
                result = &mut completion => {
                    let snapshot_id = result?;
                    tracing::info!("snapshot {} completed", snapshot_id);
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if job.is_finished() {
                        return Ok(next_id);
                    }
                }
            }
        }
        next_id += 1;
    }
    Ok(next_id)
}

fn wordcount_job(
    job: &JobExecution,
    config: &EngineConfig,
    words: usize,
    batch: usize,
    store: &InMemorySnapshotStore,
    results: Arc<Mutex<Vec<(String, u64)>>>,
) -> Vec<Box<dyn Tasklet>> {
    let text: Vec<String> = TEXT
        .split_whitespace()
        .cycle()
        .take(words)
        .map(str::to_string)
        .collect();
    let ctx = job.snapshot_context();
    let node = |name: &str| ProcessorContext::new(job.job_id(), job.execution_id(), name);
    let (words_tx, words_rx) = conduit(config.conduit_capacity);
    let (counts_tx, counts_rx) = conduit(config.conduit_capacity);

    let source = ProcessorTasklet::new(
        ListSource::new(text).with_max_per_call(batch),
        node("source"),
        Vec::new(),
        vec![words_tx],
        ctx.clone(),
        config,
    )
    .with_snapshot_writer(store.writer::<String, usize>("source#0"));
    let count = ProcessorTasklet::new(
        CountPerKey::<String>::new(),
        node("count"),
        vec![words_rx],
        vec![counts_tx],
        ctx.clone(),
        config,
    )
    .with_snapshot_writer(store.writer::<String, u64>("count#0"));
    let sink = ProcessorTasklet::new(
        CollectSink::new(results),
        node("sink"),
        vec![counts_rx],
        Vec::new(),
        ctx,
        config,
    )
    .with_snapshot_writer(store.writer::<(), ()>("sink#0"));

    vec![Box::new(source), Box::new(count), Box::new(sink)]
}
