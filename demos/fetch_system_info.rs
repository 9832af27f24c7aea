use std::error::Error;

use pulsedeck_sdk::agent_api::AgentApiClient;

fn main() -> Result<(), Box<dyn Error>> {
    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:9876".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = AgentApiClient::new()?.with_base_url(base_url);

        let info = client.system_static().await?;
        println!("{} — {} (kernel {})", info.hostname, info.os_name, info.kernel_version);
        println!(
            "{} cores ({}), {:.1} GB memory",
            info.cpu_cores, info.cpu_brand, info.total_memory_gb
        );

        for service in client.services().await? {
            println!("service {:<20} {:<30} {:?}", service.name, service.url, service.status);
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
