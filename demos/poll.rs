use std::env;
use std::time::Duration;

use nibe_uplink::{RegistryEvent, SystemRegistry, UplinkClient, UplinkConfig};

#[tokio::main]
async fn main() -> nibe_uplink::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let (Some(config_path), Some(code)) = (args.get(1), args.get(2)) else {
        eprintln!("usage: poll <config.json> <authorization-code> [--once]");
        std::process::exit(2);
    };
    let once = args.iter().any(|a| a == "--once");

    let config = UplinkConfig::load(config_path)?;
    let client = UplinkClient::builder(config.credentials())
        .base_url(&config.base_url)
        .scheduler_config(config.scheduler_config())
        .build()?;
    client.authorize(code).await?;

    let registry = SystemRegistry::load(client.clone(), &config).await?;
    let mut events = registry.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RegistryEvent::NotificationRaised { system_id, notification } => {
                    println!("[{system_id}] ALARM {}: {}", notification.title, notification.description);
                }
                RegistryEvent::AuthorizationRevoked => {
                    println!("authorization revoked, run again with a fresh code");
                }
                other => println!("{other:?}"),
            }
        }
    });

    loop {
        if let Err(e) = registry.poll_all().await {
            eprintln!("poll failed: {e}");
            if e.is_revoked() {
                break;
            }
        }
        for handle in registry.systems() {
            let system = handle.system();
            println!("{} ({}) {}", system.name, system.product_name, system.system_id);
            for parameter in handle.cache().snapshot() {
                println!("  {:>6} {:<40} {}", parameter.parameter_id.0, parameter.title, parameter.display_value);
            }
        }
        if once {
            break;
        }
        tokio::time::sleep(config.scan_interval().max(Duration::from_secs(1))).await;
    }

    registry.shutdown();
    client.shutdown();
    Ok(())
}
