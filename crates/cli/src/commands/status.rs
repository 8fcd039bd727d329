//! `kiln status`: show the resolved configuration.

use kiln_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runtime = kiln_inference::default_runtime();

    println!("🔥 kiln Status");
    println!("==============");
    println!("  Config dir:   {}", AppConfig::config_dir().display());
    println!("  Server:       {}:{}", config.server.host, config.server.port);
    println!("  Store:        {:?}", config.store.backend);
    println!("  Database:     {}", config.store.path.display());
    println!("  Window:       {}", config.context.default_window);
    println!("  Runtime:      {}", runtime.name());
    println!(
        "  Model:        {}",
        config.model.path.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Routing:      {} ({:?}, {})",
        if config.routing.enabled { "enabled" } else { "disabled" },
        config.routing.mode,
        config.routing.endpoint()
    );
    println!("  Log level:    {}", config.logging.level);

    if AppConfig::config_path().exists() {
        println!("\n  ✅ Config file found");
    } else {
        println!("\n  ⚠️  No config file, run `kiln onboard` first");
    }

    Ok(())
}
