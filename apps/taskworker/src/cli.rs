use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "taskworker")]
#[command(about = "Pull task activations from a broker and run them in isolated child processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor against the configured broker hosts
    Run(RunArgs),

    /// Serve the child executor protocol on stdin/stdout (spawned by the supervisor)
    #[command(hide = true)]
    Child,

    /// Run the supervisor against an in-memory broker seeded with demo activations
    Dev(DevArgs),

    /// Serve a local broker over gRPC
    Broker(BrokerArgs),
}

/// Knobs shared by every mode that runs a supervisor.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Worker slots, one child process each. Overrides TASKWORKER_CONCURRENCY.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Fetch from this namespace's route. Overrides TASKWORKER_NAMESPACE.
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Broker partition to fetch from
    #[arg(long)]
    pub partition: Option<u32>,

    /// Tasks a child executes before it is replaced
    #[arg(long, default_value_t = taskworker::constants::DEFAULT_CHILD_TASK_COUNT)]
    pub max_child_task_count: u64,

    /// Capacity of the queue between the fetch loop and the slots
    #[arg(long, default_value_t = taskworker::constants::DEFAULT_WORKER_QUEUE_SIZE)]
    pub queue_size: usize,

    /// File touched while broker calls succeed. Overrides TASKWORKER_HEALTH_CHECK_FILE.
    #[arg(long)]
    pub health_check_file: Option<PathBuf>,

    /// Lifetime of at-most-once markers, in seconds
    #[arg(long, default_value_t = taskworker::constants::DEFAULT_AT_MOST_ONCE_TTL.as_secs())]
    pub at_most_once_ttl_secs: u64,

    /// Run activations anyway when the at-most-once store is unreachable
    #[arg(long)]
    pub at_most_once_fail_open: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Activations fetched over one broker connection before reconnecting
    #[arg(long, default_value_t = taskworker::constants::DEFAULT_REBALANCE_AFTER)]
    pub rebalance_after: u32,
}

#[derive(Args, Debug)]
pub struct DevArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Demo activations to seed
    #[arg(long, default_value_t = 10)]
    pub count: usize,

    /// Stop once every seeded activation reached a final status
    #[arg(long)]
    pub exit_when_idle: bool,

    /// Run handlers inside the supervisor instead of child processes
    #[arg(long)]
    pub in_process: bool,
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:50051")]
    pub listen: SocketAddr,

    /// Demo activations to seed
    #[arg(long, default_value_t = 0)]
    pub seed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["taskworker", "run", "--concurrency", "8"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.worker.concurrency, Some(8));
        assert_eq!(args.worker.queue_size, 5);
        assert_eq!(args.worker.max_child_task_count, 10_000);
        assert_eq!(args.rebalance_after, 32);
        assert_eq!(args.worker.at_most_once_ttl_secs, 3600);
        assert!(!args.worker.at_most_once_fail_open);
    }

    #[test]
    fn test_dev_and_child() {
        let cli = Cli::parse_from(["taskworker", "dev", "--count", "3", "--exit-when-idle"]);
        let Commands::Dev(args) = cli.command else {
            panic!("expected dev");
        };
        assert_eq!(args.count, 3);
        assert!(args.exit_when_idle);
        assert!(!args.in_process);

        assert!(matches!(Cli::parse_from(["taskworker", "child"]).command, Commands::Child));
    }
}
