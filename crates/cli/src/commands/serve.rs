//! `kiln serve`: start the HTTP service.

use kiln_config::AppConfig;

pub async fn run(
    host: Option<String>,
    port: Option<u16>,
    model: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(model) = model {
        config.model.path = Some(model);
    }
    config.validate()?;

    let runtime = kiln_inference::default_runtime();
    tracing::debug!(runtime = runtime.name(), "Resolved model runtime");

    println!("🔥 kiln");
    println!("   Listening: {}:{}", config.server.host, config.server.port);
    println!("   Runtime:   {}", runtime.name());
    println!(
        "   Store:     {:?} ({})",
        config.store.backend,
        config.store.path.display()
    );
    println!(
        "   Routing:   {} via {}",
        if config.routing.enabled { "enabled" } else { "disabled" },
        config.routing.endpoint()
    );
    if let Some(model) = &config.model.path {
        println!("   Model:     {model}");
    }

    kiln_gateway::start(config, runtime).await?;

    Ok(())
}
