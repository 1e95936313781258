//! Interactive operator REPL attached to a running node.

use std::path::Path;
use std::time::Duration;

use stampede_core::Error;
use stampede_core::rpc::routes;
use stampede_core::serve::FairnessMode;
use stampede_proto::Process;
use stampede_proto::rpc::{
    InferenceRequest, InferenceResponse, InferenceTask, StatusFormat, StatusKind, StatusRequest,
    StatusResponse, TrainRequest, TrainResponse, TrainTask,
};
use tabled::builder::Builder;
use tabled::settings::Style;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::node::NodeHandle;

const CLIENT_RPC_DEADLINE: Duration = Duration::from_secs(300);
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Read commands from stdin until EOF. Every command is best-effort;
/// errors print and the loop continues.
pub async fn run_repl(handle: &NodeHandle, rpc: stampede_core::rpc::RpcClient) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("stampede node ready; type `help` for commands");

    while let Ok(Some(line)) = lines.next_line().await {
        let args: Vec<&str> = line.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }
        if args[0] == "stop" || args[0] == "exit" {
            break;
        }
        if let Err(err) = dispatch(handle, &rpc, &args).await {
            println!("error: {err}");
        }
    }

    handle.shutdown.cancel();
}

async fn dispatch(
    handle: &NodeHandle,
    rpc: &stampede_core::rpc::RpcClient,
    args: &[&str],
) -> Result<(), Error> {
    match args[0] {
        "help" => print_help(),

        // -- ring ----------------------------------------------------------
        "join" => handle.ring.join().await?,
        "leave" => handle.ring.leave().await,
        "list_mem" | "lm" => {
            println!("{}", members_table(&handle.ring.membership().await));
        }
        "list_self" | "l" => {
            println!("{}", members_table(&[handle.ring.self_process().await]));
        }

        // -- key-value store -----------------------------------------------
        "get" => {
            let [_, filename, local] = args else {
                return usage("get <file> <local-name>");
            };
            let path = handle.kvs_client.get_to_file(local, filename).await?;
            println!("fetched {filename} -> {}", path.display());
        }
        "put" => {
            let [_, local, filename] = args else {
                return usage("put <local-path> <file>");
            };
            handle.kvs_client.put(Path::new(local), filename).await?;
            println!("stored {filename}");
        }
        "delete" => {
            let [_, filename] = args else {
                return usage("delete <file>");
            };
            handle.kvs_client.delete(filename).await?;
            println!("deleted {filename}");
        }
        "ls" => {
            let [_, filename] = args else {
                return usage("ls <file>");
            };
            for host in handle.kvs_client.list(filename).await? {
                println!("{host}");
            }
        }
        "store" => {
            let (address, files) = handle.kvs_node.store_listing().await;
            println!("files hosted by {address}:");
            for file in files {
                println!(
                    "  {} ({} versions, latest count {})",
                    file.filename,
                    file.versions,
                    file.latest_seq.map(|seq| seq.count).unwrap_or_default()
                );
            }
        }
        "get-versions" => {
            let [_, filename, count, local] = args else {
                return usage("get-versions <file> <num-versions> <local-name>");
            };
            let count: usize = count
                .parse()
                .map_err(|_| Error::Internal("num-versions must be a number".to_string()))?;
            let versions = handle.kvs_client.get_versions(filename, count).await?;
            let fetched = versions.len();
            let mut joined = Vec::new();
            for (i, data) in versions.into_iter().enumerate() {
                if i > 0 {
                    joined.extend_from_slice(b"\n----- older version -----\n");
                }
                joined.extend_from_slice(&data);
            }
            handle.kvs_client.write_local_file(local, &joined).await?;
            println!("wrote {fetched} versions of {filename} to {local}");
        }
        "putdir" => {
            let [_, local_dir, store_dir] = args else {
                return usage("putdir <local-dir> <store-dir>");
            };
            let stored = handle
                .kvs_client
                .put_dir(Path::new(local_dir), store_dir)
                .await?;
            println!("stored {} files under {store_dir}", stored.len());
        }
        "valdir" => {
            let [_, store_dir] = args else {
                return usage("valdir <store-dir>");
            };
            for (name, present) in handle.kvs_client.validate_dir(store_dir).await? {
                println!("{name}: {}", if present { "ok" } else { "MISSING" });
            }
        }
        "deldir" => {
            let [_, store_dir] = args else {
                return usage("deldir <store-dir>");
            };
            let deleted = handle.kvs_client.delete_dir(store_dir).await?;
            println!("deleted {deleted} files and the manifest {store_dir}");
        }

        // -- jobs ----------------------------------------------------------
        "train" => {
            let [_, model, dataset] = args else {
                return usage("train <model> <dataset>");
            };
            let leader = leader_addr(handle).await?;
            let _: TrainResponse = rpc
                .post(
                    &leader,
                    routes::COORD_TRAIN,
                    &TrainRequest {
                        task: TrainTask {
                            model: model.to_string(),
                            dataset: dataset.to_string(),
                        },
                    },
                    CLIENT_RPC_DEADLINE,
                )
                .await?;
            println!("model {model} trained on {dataset}");
        }
        "serve" => {
            let [_, model, batch_size] = args else {
                return usage("serve <model> <batch-size>");
            };
            let batch_size: usize = batch_size
                .parse()
                .map_err(|_| Error::Internal("batch-size must be a number".to_string()))?;
            let leader = leader_addr(handle).await?;
            let _: InferenceResponse = rpc
                .post(
                    &leader,
                    routes::COORD_INFERENCE,
                    &InferenceRequest {
                        task: InferenceTask {
                            model: model.to_string(),
                            batch_size,
                        },
                        job_id: None,
                    },
                    CLIENT_RPC_DEADLINE,
                )
                .await?;
            println!("inference task queued for {model} (batch size {batch_size})");
        }
        "qps" => {
            let [_, mode] = args else {
                return usage("qps <local|global>");
            };
            let mode = match *mode {
                "local" => FairnessMode::Local,
                "global" => FairnessMode::Global,
                _ => return usage("qps <local|global>"),
            };
            handle.coordinator.set_fairness(mode).await;
            println!("fairness mode set");
        }

        // -- status --------------------------------------------------------
        "status-workers" => print_status(handle, rpc, StatusKind::Workers, "").await?,
        "status-jobs" => print_status(handle, rpc, StatusKind::Jobs, "").await?,
        "status-completed" => print_status(handle, rpc, StatusKind::CompletedJobs, "").await?,
        "status-job" => {
            let [_, id] = args else {
                return usage("status-job <job-id>");
            };
            print_status(handle, rpc, StatusKind::JobDetail, id).await?;
        }
        "status-job-stats" => {
            let [_, id] = args else {
                return usage("status-job-stats <job-id>");
            };
            print_status(handle, rpc, StatusKind::JobStats, id).await?;
        }

        // -- diagnostics ---------------------------------------------------
        "greet" => {
            let [_, name] = args else {
                return usage("greet <name>");
            };
            let response = handle.worker.greet(name.to_string()).await?;
            println!("{}", response.message);
        }

        other => println!("unknown command {other:?}; type `help`"),
    }
    Ok(())
}

async fn leader_addr(handle: &NodeHandle) -> Result<String, Error> {
    handle.ring.lookup_leader().await?.ok_or(Error::NoLeader)
}

async fn print_status(
    handle: &NodeHandle,
    rpc: &stampede_core::rpc::RpcClient,
    which: StatusKind,
    payload: &str,
) -> Result<(), Error> {
    let leader = leader_addr(handle).await?;
    let response: StatusResponse = rpc
        .post(
            &leader,
            routes::COORD_STATUS,
            &StatusRequest {
                which,
                format: StatusFormat::Text,
                payload: payload.to_string(),
            },
            Duration::from_secs(5),
        )
        .await?;
    println!("{}", response.message);
    Ok(())
}

fn members_table(members: &[Process]) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Machine Address", "Join Time", "Status"]);
    for member in members {
        builder.push_record([
            member.address(),
            member.join_time.format(TIME_FORMAT).to_string(),
            member.status.to_string(),
        ]);
    }
    builder.push_record([
        "Total Machines".to_string(),
        members.len().to_string(),
        String::new(),
    ]);

    let mut table = builder.build();
    table.with(Style::sharp());
    table.to_string()
}

fn usage(text: &str) -> Result<(), Error> {
    println!("usage: {text}");
    Ok(())
}

fn print_help() {
    println!(
        "\
ring:    join | leave | list_mem | list_self
store:   get <file> <local> | put <local> <file> | delete <file> | ls <file>
         store | get-versions <file> <n> <local>
         putdir <dir> <store-dir> | valdir <store-dir> | deldir <store-dir>
jobs:    train <model> <dataset> | serve <model> <batch-size> | qps <local|global>
status:  status-workers | status-jobs | status-job <id>
         status-job-stats <id> | status-completed
misc:    greet <name> | stop"
    );
}
