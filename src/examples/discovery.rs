//! Simple example of driving the pool with the in-process backends.

use std::sync::Arc;

use proxy_rotation_pool::{
    MemoryBackend, MemoryDurableStore, PoolConfig, PoolManager, Protocol,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = PoolConfig::builder().initial_seed_count(50).build();
    let manager = PoolManager::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(MemoryDurableStore::new()),
        config,
    )
    .await?;

    println!("Discovering proxies...");
    manager.new_proxy("203.0.113.10", 8080, Protocol::Http).await?;
    manager.new_proxy("203.0.113.11", 3128, Protocol::Https).await?;
    // Duplicate report; deduped by (address, port).
    manager.new_proxy("203.0.113.10", 8080, Protocol::Http).await?;

    let queue = manager.create_queue("https://example.com/search").await?;
    println!("Created queue for domain: {}", queue.domain);

    let seed = manager.seed_queue().await?;
    let seed_rotation = manager.rotation(&seed, false)?;
    seed_rotation.reload().await?;
    println!("Seed rotation holds {} details", seed_rotation.length().await?);

    let detail = seed_rotation.dequeue(true).await?;
    let cloned = manager.clone_detail(&detail, &queue).await?;
    println!(
        "Cloned proxy standing into '{}' (key {:?})",
        queue.domain,
        cloned.detail_key()
    );

    println!("Writing the cache back to the durable store...");
    manager.sync_to_db().await?;
    println!("Done.");

    Ok(())
}
