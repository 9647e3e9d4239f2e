use sdx_cluster::{InstanceId, MemoryNetwork, Result};
use sdx_core::lwwreg::{LwwOperation, LwwOutcome};
use simulation::{simulate_cluster, simulate_scaling, start_cluster, Profiles};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod simulation;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(true)
        .init();

    last_writer_wins().await?;

    // Test 1: small cluster, every node a write replica
    let stats = simulate_cluster(3, 4, 3, 200).await?;
    stats.print();

    // Test 2: more nodes than replicas, so some writes are rerouted
    let stats = simulate_cluster(6, 8, 3, 1000).await?;
    stats.print();

    // Test 3: scaling analysis
    simulate_scaling(12, 3).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}

/// Two clients race on one key through different nodes; the older write
/// comes back as a conflict carrying the current winner.
async fn last_writer_wins() -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Last-Writer-Wins Registry                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, 3, 1, 2).await?;
    let id = InstanceId::new("profiles");
    nodes[0].create_instance::<Profiles>("profiles").await?;

    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let set = |value: &str, time: u64| LwwOperation::Set {
        key: "alice".to_string(),
        value: value.to_string(),
        time,
    };

    let newer = nodes[1].instance::<Profiles>(&id)?.execute(set("alice@new.example", now)).await?;
    let older = nodes[2]
        .instance::<Profiles>(&id)?
        .execute(set("alice@old.example", now.saturating_sub(1_000)))
        .await?;
    info!(?newer, ?older, "concurrent writes settled");

    match older {
        LwwOutcome::Conflict { winner, stamp } => println!(
            "  older write rejected: winner {:?} written by {} at {}",
            winner, stamp.actor, stamp.time
        ),
        LwwOutcome::Applied => println!("  older write applied"),
    }

    for node in &nodes {
        let value = node
            .instance::<Profiles>(&id)?
            .read(&"alice".to_string(), |registry| registry.get(&"alice".to_string()).cloned())?;
        println!("  {} reads {:?}", node.id(), value);
        node.shutdown().await;
    }
    Ok(())
}
