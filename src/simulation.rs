use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdx_cluster::{
    ClusterNode, CrdtTypeRegistry, InstanceId, MemoryNetwork, NodeConfig, Result, StaticDiscovery,
};
use sdx_core::lwwreg::LwwRegistry;
use sdx_core::orset::{OrSet, OrSetOperation};
use std::time::{Duration, Instant};

pub type Tags = OrSet<String>;
pub type Profiles = LwwRegistry<String, String>;

/// Statistics collected during a cluster simulation
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub nodes: usize,
    pub writes: usize,
    pub failed_writes: usize,
    pub repair_rounds: usize,
    pub batches_repaired: usize,
    pub total_time: Duration,
    pub writes_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Nodes:                     {:>30} ║", self.nodes);
        println!("║  Writes:                    {:>30} ║", self.writes);
        println!("║  Failed Writes:             {:>30} ║", self.failed_writes);
        println!("║  Anti-Entropy Rounds:       {:>30} ║", self.repair_rounds);
        println!("║  Batches Repaired:          {:>30} ║", self.batches_repaired);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Writes/Second:             {:>30.0} ║", self.writes_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

pub fn registry() -> CrdtTypeRegistry {
    CrdtTypeRegistry::new()
        .register::<Tags>("orset<string>")
        .register::<Profiles>("lww<string,string>")
}

/// Node `i` of a simulated cluster.
pub fn node_name(i: usize) -> String {
    format!("node-{:02}", i)
}

pub fn node_address(i: usize) -> String {
    format!("mem://{}", node_name(i))
}

/// Start `count` nodes on `network`; every node after the first joins through it.
pub async fn start_cluster(network: &MemoryNetwork, count: usize, shards: u16, replicas: u32) -> Result<Vec<ClusterNode>> {
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let config = NodeConfig::builder()
            .node_id(node_name(i))
            .address(node_address(i))
            .shard_count(shards)
            .replica_count(replicas)
            .build()?;
        let node = ClusterNode::new(config, network.provider_for(node_address(i)), registry())?;
        network.register(node.service());
        nodes.push(node);
    }

    let seed = StaticDiscovery::new([node_address(0)]);
    for node in nodes.iter().skip(1) {
        node.join(&seed).await?;
    }
    Ok(nodes)
}

/// Generator that yields (node index, item) pairs for writes
fn write_generator(num_nodes: usize, num_writes: usize) -> impl Stream<Item = (usize, String)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for i in 0..num_writes {
            let node = rng.gen_range(0..num_nodes);
            yield (node, format!("item_{}_{}", node, i));
        }
    }
}

/// Random writes through random nodes while one node is cut off, then
/// anti-entropy rounds until a full round moves nothing.
pub async fn simulate_cluster(num_nodes: usize, shards: u16, replicas: u32, num_writes: usize) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        OR-Set Cluster Simulation                           ║");
    println!("║  Nodes: {} | Shards: {} | Replicas: {} | Writes: {} ║",
             num_nodes, shards, replicas, num_writes);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = MemoryNetwork::new();
    let nodes = start_cluster(&network, num_nodes, shards, replicas).await?;
    nodes[0].create_instance::<Tags>("tags").await?;

    let cut = node_address(num_nodes - 1);
    network.set_reachable(&cut, false);
    println!("\n[Phase 1/2] Writing while {} is cut off...", cut);

    let mut writes = Box::pin(write_generator(num_nodes, num_writes));
    let mut failed_writes = 0;
    while let Some((idx, item)) = writes.next().await {
        let tags = nodes[idx].instance::<Tags>(&InstanceId::new("tags"))?;
        if tags.execute(OrSetOperation::Add { item }).await.is_err() {
            failed_writes += 1;
        }
    }
    network.set_reachable(&cut, true);

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Repairing with anti-entropy...");

    let mut repair_rounds = 0;
    let mut batches_repaired = 0;
    loop {
        let mut moved = 0;
        for node in &nodes {
            let summary = node.sync_once().await?;
            moved += summary.batches_sent + summary.batches_received;
        }
        repair_rounds += 1;
        batches_repaired += moved;
        if moved == 0 || repair_rounds >= num_nodes * 2 {
            break;
        }
    }

    let total_time = start.elapsed();
    println!("[Phase 2/2] ✓ Completed");

    for node in &nodes {
        node.shutdown().await;
    }

    Ok(SimulationStats {
        nodes: num_nodes,
        writes: num_writes,
        failed_writes,
        repair_rounds,
        batches_repaired,
        total_time,
        writes_per_second: num_writes as f64 / total_time.as_secs_f64(),
    })
}

/// Compare simulations across cluster sizes
pub async fn simulate_scaling(max_nodes: usize, step_size: usize) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Repair Cost vs Cluster Size        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current = step_size.max(2);
    while current <= max_nodes {
        let stats = simulate_cluster(current, 8, 3, current * 50).await?;
        stats.print();
        current += step_size;
    }
    Ok(())
}
