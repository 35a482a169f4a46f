use distributed_exec::config::SchedulerConfig;
use distributed_exec::node::{self, NodeRole};
use distributed_exec::protocol::{Job, JobOutput};
use distributed_exec::transport::tcp::{TcpMaster, connect_to_master};
use distributed_exec::transport::{Communicator, LocalCluster};
use distributed_exec::value::{Grid, Value};
use distributed_exec::worker::CommandRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Master,
    Worker,
    Local,
}

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} --role <master|worker|local> [options]", program);
    eprintln!(
        "Example: {} --role master --bind 0.0.0.0:7000 --workers 4 --status 127.0.0.1:8080",
        program
    );
    eprintln!("Example: {} --role worker --connect 10.0.0.1:7000 --name node-a", program);
    eprintln!("Example: {} --role local --workers 3 --indices 100", program);
    std::process::exit(1);
}

fn value_of<'a>(args: &'a [String], i: usize) -> anyhow::Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("{} needs a value", args[i]))
}

/// Demo command: doubles every row of the `Input` column into `Output`.
fn double(job: &Job) -> JobOutput {
    let mut output = JobOutput::for_job(job);
    let input = job.input("Input");
    let mut result = Grid::new(input.dimensions().0, 1);
    for &index in &job.indices {
        if let Some(value) = input.as_grid().and_then(|grid| grid.get(index, 0).scalar()) {
            result.set(index, 0, Value::Scalar(value * 2.0));
        }
    }
    output.set("Output", Value::Grid(result));
    output
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage(&args[0]);
    }

    let mut role: Option<Role> = None;
    let mut bind_addr: Option<SocketAddr> = None;
    let mut master_addr: Option<SocketAddr> = None;
    let mut status_addr: Option<SocketAddr> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut name: Option<String> = None;
    let mut workers: usize = 2;
    let mut indices: usize = 20;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--role" => {
                role = match value_of(&args, i)? {
                    "master" => Some(Role::Master),
                    "worker" => Some(Role::Worker),
                    "local" => Some(Role::Local),
                    other => anyhow::bail!("Unknown role: {}", other),
                };
                i += 2;
            }
            "--bind" => {
                bind_addr = Some(value_of(&args, i)?.parse()?);
                i += 2;
            }
            "--connect" => {
                master_addr = Some(value_of(&args, i)?.parse()?);
                i += 2;
            }
            "--status" => {
                status_addr = Some(value_of(&args, i)?.parse()?);
                i += 2;
            }
            "--config" => {
                config_path = Some(PathBuf::from(value_of(&args, i)?));
                i += 2;
            }
            "--name" => {
                name = Some(value_of(&args, i)?.to_string());
                i += 2;
            }
            "--workers" => {
                workers = value_of(&args, i)?.parse()?;
                i += 2;
            }
            "--indices" => {
                indices = value_of(&args, i)?.parse()?;
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let Some(role) = role else {
        usage(&args[0]);
    };

    let config = SchedulerConfig::load(config_path.as_deref())?;
    let host = name.unwrap_or_else(node::host_name);

    let registry = CommandRegistry::new();
    registry.register("double", double);
    tracing::info!("Commands available: {:?}", registry.list_commands());

    match role {
        Role::Worker => {
            let Some(master_addr) = master_addr else {
                anyhow::bail!("--connect is required for a worker");
            };
            tracing::info!("Connecting to master at {} as {}", master_addr, host);
            let comm = connect_to_master(master_addr, &host, 10).await?;
            node::start(comm, registry, config, &host).await?;
            tracing::info!("Finish received, shutting down");
        }
        Role::Master => {
            let Some(bind_addr) = bind_addr else {
                anyhow::bail!("--bind is required for the master");
            };
            let master = TcpMaster::bind(bind_addr).await?;
            tracing::info!("Waiting for {} workers on {}", workers, master.local_addr()?);
            let (comm, names) = master.accept_workers(workers, Duration::from_secs(60)).await?;
            tracing::info!("Workers connected: {:?}", names);
            run_master(comm, registry, config, &host, status_addr, indices).await?;
        }
        Role::Local => {
            let mut group = LocalCluster::build(workers + 1).into_iter();
            let Some(master_comm) = group.next() else {
                anyhow::bail!("Local group has no master");
            };

            for comm in group {
                let registry = registry.clone();
                let config = config.clone();
                let host = format!("{}-{}", host, comm.rank());
                tokio::spawn(async move {
                    if let Err(e) = node::start(comm, registry, config, &host).await {
                        tracing::error!("Local worker stopped: {:#}", e);
                    }
                });
            }

            run_master(master_comm, registry, config, &host, status_addr, indices).await?;
        }
    }

    Ok(())
}

async fn run_master(
    comm: Arc<Communicator>,
    registry: Arc<CommandRegistry>,
    config: SchedulerConfig,
    host: &str,
    status_addr: Option<SocketAddr>,
    indices: usize,
) -> anyhow::Result<()> {
    let NodeRole::Master(scheduler) = node::start(comm, registry, config, host).await? else {
        anyhow::bail!("This process was not given rank 0");
    };

    if let Some(addr) = status_addr {
        scheduler.serve_progress(addr).await?;
    }

    let hosts = scheduler.identify_workers().await;
    tracing::info!("Identified {} workers", hosts.len());

    let job = Job::new("double")
        .with_indices(0..indices)
        .with_variable("Input", Value::column((0..indices).map(|i| i as f64)));

    match scheduler.execute(&job).await {
        Ok(output) => {
            tracing::info!(
                "Job {} finished: {} indices, variables {:?}",
                output.command,
                output.indices.len(),
                output.variables.keys().collect::<Vec<_>>()
            );
            let acknowledged = scheduler.finish().await;
            tracing::info!("{} workers acknowledged finish", acknowledged);
            Ok(())
        }
        Err(e) => {
            let reason = e.to_string();
            Err(scheduler.abort(&reason).await.into())
        }
    }
}
