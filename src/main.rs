use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;
use prettytable::{row, Table};

use simon::apply::{Applier, ApplyOptions, ApplyOutcome};
use simon::config::{init_logging, load_resources_from_path};
use simon::deschedule::run_deschedule;
use simon::error::SimonError;
use simon::migrate::{DownScaler, MigrationResult};
use simon::report::{build_report, print_report};

#[derive(Parser)]
#[command(
    name = "simon",
    about = "Deterministic offline capacity planning for container clusters"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Make a cluster capacity plan based on application resource requirements
    Apply {
        /// Path to the plan yaml (kind: Simon)
        #[arg(long = "simon-config", short = 'f')]
        simon_config: PathBuf,
        /// Path to a scheduler configuration file (accepted for
        /// compatibility, the embedded profile is always used)
        #[arg(long = "default-scheduler-config")]
        default_scheduler_config: Option<PathBuf>,
        /// Use the greedy queue ordering
        #[arg(
            long = "use-greed",
            default_value_t = true,
            action = clap::ArgAction::Set,
            num_args = 0..=1,
            default_missing_value = "true"
        )]
        use_greed: bool,
        /// Ask before every extra search iteration
        #[arg(long, short = 'i')]
        interactive: bool,
    },
    /// Report per-node migration plans for compacting the cluster
    Deschedule {
        /// Cluster snapshot directory (an exported kubeconfig snapshot)
        #[arg(long)]
        kubeconfig: PathBuf,
    },
    /// Decide which workers can be evacuated and where their pods move
    Migrate {
        /// Cluster snapshot directory (an exported kubeconfig snapshot)
        #[arg(long = "kube-config")]
        kube_config: PathBuf,
        /// Nodes to consider for removal (default: all workers)
        #[arg(long = "nodes-to-be-removed", short = 'n')]
        nodes_to_be_removed: Vec<String>,
        /// Label filters pinning nodes whose pods match (key=value)
        #[arg(long = "label-filter", short = 'l')]
        label_filter: Vec<String>,
        #[arg(
            long = "maximum-average-utilization",
            short = 'u',
            default_value_t = 100
        )]
        maximum_average_utilization: i64,
    },
}

/// The snapshot commands accept a directory of exported manifests; a real
/// kubeconfig would need a live-cluster collaborator.
fn load_snapshot(path: &Path) -> Result<simon::core::cluster::ResourceTypes, SimonError> {
    if !path.is_dir() {
        return Err(SimonError::Environmental(format!(
            "{:?} is not a cluster snapshot directory; snapshotting a live \
             cluster through a kubeconfig requires a collaborator",
            path
        )));
    }
    load_resources_from_path(path)
}

fn run_apply(
    simon_config: &Path,
    use_greed: bool,
    interactive: bool,
) -> Result<(), SimonError> {
    let applier = Applier::from_plan_file(
        simon_config,
        ApplyOptions {
            use_greed,
            interactive,
        },
    )?;
    match applier.run()? {
        ApplyOutcome::Fits { new_nodes, result } => {
            println!("Success with {} new node(s).", new_nodes);
            print_report(&build_report(&result));
        }
        ApplyOutcome::Unsatisfiable { pods } => {
            println!(
                "The following pods cannot fit the template node; adding more \
                 identical nodes cannot help:"
            );
            let mut table = Table::new();
            table.add_row(row!["Pod", "Reason"]);
            for entry in pods {
                table.add_row(row![entry.pod.key(), entry.reason]);
            }
            table.printstd();
        }
        ApplyOutcome::CapReached {
            cap,
            last_unscheduled,
        } => {
            println!(
                "No fit within {} new node(s); {} pod(s) still unscheduled.",
                cap,
                last_unscheduled.len()
            );
        }
    }
    Ok(())
}

fn run_deschedule_command(kubeconfig: &Path) -> Result<(), SimonError> {
    let cluster = load_snapshot(kubeconfig)?;
    let plans = run_deschedule(&cluster.nodes, &cluster.pods)?;
    if plans.is_empty() {
        println!("No pods need to move.");
        return Ok(());
    }
    let mut table = Table::new();
    table.add_row(row!["Pod", "From", "To", "Owners"]);
    for plan in plans {
        let owners = plan
            .pod_owner_refs
            .iter()
            .map(|r| format!("{}/{}", r.kind, r.name))
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(row![
            format!("{}/{}", plan.pod_namespace, plan.pod_name),
            plan.from_node,
            plan.to_node,
            owners
        ]);
    }
    table.printstd();
    Ok(())
}

fn print_migration_result(result: &MigrationResult) {
    let mut table = Table::new();
    table.add_row(row!["Node", "Removable", "Reason"]);
    for status in &result.nodes_migration_status {
        table.add_row(row![
            status.node_name,
            if status.is_removable { "yes" } else { "no" },
            status.reason
        ]);
    }
    table.printstd();

    for status in &result.nodes_migration_status {
        if !status.is_removable || status.pod_plans.is_empty() {
            continue;
        }
        println!("Migration plan for node {}:", status.node_name);
        let mut plan_table = Table::new();
        plan_table.add_row(row!["Pod", "From", "To"]);
        for plan in &status.pod_plans {
            plan_table.add_row(row![
                format!("{}/{}", plan.pod_namespace, plan.pod_name),
                plan.from_node,
                plan.to_node
            ]);
        }
        plan_table.printstd();
    }
}

fn run_migrate(
    kube_config: &Path,
    nodes_to_be_removed: Vec<String>,
    label_filter: Vec<String>,
    maximum_average_utilization: i64,
) -> Result<(), SimonError> {
    let cluster = load_snapshot(kube_config)?;
    let down_scaler = DownScaler::new(
        nodes_to_be_removed,
        label_filter,
        maximum_average_utilization,
    );
    let result = down_scaler.migrate(&cluster)?;
    print_migration_result(&result);
    Ok(())
}

fn run(cli: Cli) -> Result<(), SimonError> {
    match cli.command {
        Commands::Apply {
            simon_config,
            default_scheduler_config: _,
            use_greed,
            interactive,
        } => run_apply(&simon_config, use_greed, interactive),
        Commands::Deschedule { kubeconfig } => run_deschedule_command(&kubeconfig),
        Commands::Migrate {
            kube_config,
            nodes_to_be_removed,
            label_filter,
            maximum_average_utilization,
        } => run_migrate(
            &kube_config,
            nodes_to_be_removed,
            label_filter,
            maximum_average_utilization,
        ),
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
