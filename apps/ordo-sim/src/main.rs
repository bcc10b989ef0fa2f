mod cluster;
mod config;

use cluster::SimCluster;
use ordo_raft::counter::{CounterStateMachine, GET};
use ordo_raft::{ClientId, ClientRequest, LogIndex, ReplicatedLog};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ordo-sim.yaml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        tracing::info!("Loading configuration from: {}", config_path);
        config::SimConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        config::SimConfig::load_from_env()?
    };

    tracing::info!(
        servers = config.servers,
        clients = config.workload.clients,
        requests = config.workload.requests,
        "Starting simulation"
    );

    let cluster = Arc::new(SimCluster::start(&config).await?);
    let leader = cluster.wait_for_leader().await?;
    tracing::info!(leader = %cluster.servers()[leader].id, "Leader elected");

    let next_call = Arc::new(AtomicU64::new(1));
    let acknowledged = Arc::new(AtomicU64::new(0));
    let total = config.workload.requests;

    let mut clients = Vec::with_capacity(config.workload.clients);
    for _ in 0..config.workload.clients {
        let cluster = cluster.clone();
        let next_call = next_call.clone();
        let acknowledged = acknowledged.clone();
        clients.push(tokio::spawn(async move {
            let client = ClientId::random();
            let mut highest = LogIndex::ZERO;
            loop {
                let call_id = next_call.fetch_add(1, Ordering::SeqCst);
                if call_id > total {
                    return Ok::<_, ordo_raft::RaftError>(highest);
                }
                let reply = cluster.increment(client, call_id).await?;
                highest = highest.max(reply.log_index);
                acknowledged.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    if config.workload.partition_leader_every > 0 {
        let cluster = cluster.clone();
        let acknowledged = acknowledged.clone();
        let every = config.workload.partition_leader_every;
        tokio::spawn(async move {
            let mut next_fault = every;
            while acknowledged.load(Ordering::SeqCst) < total {
                if acknowledged.load(Ordering::SeqCst) >= next_fault {
                    if let Ok(leader) = cluster.wait_for_leader().await {
                        cluster.isolate(leader);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        cluster.reconnect(leader);
                    }
                    next_fault += every;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
    }

    let workload = async {
        let mut last = LogIndex::ZERO;
        for client in clients {
            last = last.max(client.await??);
        }
        Ok::<_, Box<dyn std::error::Error>>(last)
    };
    let last = tokio::select! {
        result = workload => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping early");
            cluster.shutdown();
            return Ok(());
        }
    };

    let values = cluster.converged_values(last).await?;
    tracing::info!(
        acknowledged = acknowledged.load(Ordering::SeqCst),
        values = ?values,
        "Simulation finished"
    );

    let leader = cluster.wait_for_leader().await?;
    let raft = &cluster.servers()[leader].raft;
    let read = raft
        .query(ClientRequest::read(ClientId::random(), 0, GET))
        .await?;
    let snapshot = raft.take_snapshot().await?;
    tracing::info!(
        value = CounterStateMachine::decode_value(&read.message)?,
        read_index = %read.log_index,
        snapshot = %snapshot,
        "Linearizable read and snapshot on leader"
    );

    let consistent = values.windows(2).all(|w| w[0] == w[1]);
    cluster.shutdown();
    if !consistent {
        return Err("replicas diverged".into());
    }
    Ok(())
}
