use std::error::Error;

use pulsedeck_sdk::realtime::channel::{ChannelOptions, RealtimeChannel};
use pulsedeck_sdk::realtime::feed::{TelemetryEvent, TelemetryFeed};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost:9876".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let channel = RealtimeChannel::new(ChannelOptions::for_host(&host));
        let mut feed = TelemetryFeed::attach(&channel);
        channel.connect();

        while let Some(event) = feed.recv().await {
            match event {
                TelemetryEvent::ConnectionChanged(connected) => {
                    println!("connection: {}", if connected { "up" } else { "down" });
                }
                TelemetryEvent::Snapshot(snapshot) => {
                    println!(
                        "cpu={:.1}% mem={:.1}% load1={:.2} uptime={}s processes={} containers={}",
                        snapshot.cpu.total_usage,
                        snapshot.memory.used_percent,
                        snapshot.load_average.one,
                        snapshot.uptime_secs,
                        snapshot.processes.len(),
                        snapshot.docker_containers.len(),
                    );
                }
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
