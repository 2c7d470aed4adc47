//! Command-line harness for `tres-core`. Builds a small demo cluster in
//! memory, submits a job described by CLI flags, and prints the
//! placement result as JSON — useful for exercising the engine by hand
//! without wiring it into a real scheduler.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tres_core::config::EngineConfig;
use tres_core::model::{
    Contiguity, GresInventory, JobId, JobRequest, MemRequirement, Node, NodeId, NodeState, Partition, PartitionId,
    PreemptMode,
};
use tres_core::{Cluster, PlacementError};

#[derive(Parser)]
#[command(name = "tres-cli", about = "Exercise the tres-core placement engine by hand")]
struct Cli {
    /// Tracing filter, e.g. "tres_core=debug".
    #[arg(long, default_value = "tres_core=info")]
    log: String,

    #[arg(long, default_value_t = 4)]
    demo_nodes: u32,

    #[arg(long, default_value_t = 2)]
    sockets_per_node: u32,

    #[arg(long, default_value_t = 8)]
    cores_per_socket: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe feasibility only; no state is mutated.
    TestOnly(JobArgs),
    /// Allocate the job immediately against the demo cluster.
    RunNow(JobArgs),
}

#[derive(Parser)]
struct JobArgs {
    #[arg(long, default_value_t = 1)]
    job_id: u64,

    #[arg(long, default_value_t = 4)]
    min_cpus: u32,

    #[arg(long, default_value_t = 1)]
    min_nodes: u32,

    #[arg(long, default_value_t = 4)]
    max_nodes: u32,

    #[arg(long)]
    whole_node: bool,

    #[arg(long, default_value_t = 1)]
    cpus_per_task: u32,
}

#[derive(Serialize)]
struct PlacementReport {
    outcome: String,
    nodes: Vec<u32>,
    total_cpus: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let mut cluster = build_demo_cluster(cli.demo_nodes, cli.sockets_per_node, cli.cores_per_socket);

    let report = match cli.command {
        Command::TestOnly(args) => {
            let job = job_from_args(&args);
            match cluster.test_only(&job) {
                Ok(()) => PlacementReport { outcome: "feasible".into(), nodes: vec![], total_cpus: 0 },
                Err(e) => report_error(e),
            }
        }
        Command::RunNow(args) => {
            let job = job_from_args(&args);
            match cluster.run_now(&job) {
                Ok(resources) => PlacementReport {
                    outcome: "placed".into(),
                    nodes: resources.node_ids.iter().map(|n| n.0).collect(),
                    total_cpus: resources.total_cpus,
                },
                Err(e) => report_error(e),
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report).context("serializing placement report")?);
    Ok(())
}

fn report_error(e: PlacementError) -> PlacementReport {
    PlacementReport { outcome: e.to_string(), nodes: vec![], total_cpus: 0 }
}

fn init_logging(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

fn build_demo_cluster(node_count: u32, sockets: u32, cores_per_socket: u32) -> Cluster {
    let nodes: Vec<Node> = (0..node_count)
        .map(|i| Node {
            id: NodeId(i),
            name: format!("node{i}"),
            socket_count: sockets,
            cores_per_socket,
            threads_per_core: 1,
            real_memory_mb: 64_000,
            mem_spec_limit_mb: 1_000,
            gres_inventory: GresInventory::none(sockets as usize),
            sched_weight: 0,
        })
        .collect();

    let partitions = vec![Partition {
        id: PartitionId(0),
        name: "demo".into(),
        priority: 0,
        preempt_mode: PreemptMode::Off,
        max_cpus_per_node: None,
        oversubscribable: false,
    }];

    Cluster::new(nodes, partitions, EngineConfig::default())
}

fn job_from_args(args: &JobArgs) -> JobRequest {
    JobRequest {
        job_id: JobId(args.job_id),
        partition_id: PartitionId(0),
        min_cpus: args.min_cpus,
        cpus_per_task: args.cpus_per_task,
        num_tasks: args.min_cpus / args.cpus_per_task.max(1),
        min_nodes: args.min_nodes,
        req_nodes: args.min_nodes,
        max_nodes: args.max_nodes,
        ntasks_per_node: None,
        ntasks_per_socket: None,
        ntasks_per_core: None,
        min_sockets_per_node: None,
        min_cores_per_socket: None,
        threads_per_core_cap: None,
        pn_min_cpus: 1,
        pn_min_memory: MemRequirement::PerCpuMb(512),
        whole_node: args.whole_node,
        node_req: NodeState::Available,
        contiguous: Contiguity::Any,
        overcommit: false,
        core_spec_threads: None,
        req_node_bitmap: None,
        gres_request: None,
        preempt_mode: PreemptMode::Off,
        no_cpu_sharing: false,
    }
}
