use std::time::Duration;

use log::{info, warn};
use revolt_coalesced::{Callbacks, Coalescer, CoalescerConfig, Operation, Result};
use tokio::time::sleep;

/// Pretend transport: a search request that takes a while to answer.
fn search() -> Operation<String> {
    Operation::new(|query: String| async move {
        info!("Searching for {query:?}");
        sleep(Duration::from_millis(800)).await;
        info!("Search for {query:?} answered");
    })
}

fn report() -> Callbacks<String> {
    Callbacks::new()
        .on_success(|reservation| info!("Dispatched {:?}", reservation.arguments))
        .on_failure(|reservation, error| warn!("Gave up on {:?}: {error}", reservation.arguments))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or("RUST_LOG", "info"));

    let config = CoalescerConfig::load()?;
    info!("Starting coalescer demo with {config:?}");

    let coalescer = Coalescer::from_config(config)?;

    // someone typing into a search box
    for query in ["r", "re", "rev", "revo", "revolt"] {
        coalescer.reserve(search(), query.to_string(), report());
        sleep(Duration::from_millis(120)).await;
    }

    sleep(Duration::from_millis(600)).await;

    // a second burst arrives while the first search is still running
    for query in ["revolt chat", "revolt backend"] {
        coalescer.reserve(search(), query.to_string(), report());
        sleep(Duration::from_millis(50)).await;
    }

    while coalescer.is_pending() || coalescer.is_in_flight() {
        sleep(Duration::from_millis(100)).await;
    }

    info!("All reservations settled");
    Ok(())
}
