//! `kiln config`: configuration management commands.

use kiln_config::{AppConfig, StoreBackend};

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if config.model.path.is_none() {
                warnings.push("No startup model set (model.path or KILN_MODEL)");
            }

            if config.store.backend == StoreBackend::Memory {
                warnings.push("Memory store backend does not persist across restarts");
            }

            if config.server.host == "0.0.0.0" {
                warnings.push("Server bound to 0.0.0.0 with CORS open to any origin");
            }

            if config.context.default_window == 0 {
                warnings.push("context.default_window is 0, history is never included");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            println!();
            println!(
                "   Server:   {}:{}",
                config.server.host, config.server.port
            );
            println!("   Store:    {:?}", config.store.backend);
            println!("   Routing:  {:?} -> {}", config.routing.mode, config.routing.endpoint());
            println!(
                "   Retries:  {} attempt(s)",
                config.model.retry.max_attempts
            );
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use kiln_config::AppConfig;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_path();
        assert!(path.to_str().unwrap().ends_with("config.toml"));
        assert!(path.starts_with(AppConfig::config_dir()));
    }

    #[test]
    fn shown_config_parses_back() {
        let rendered = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 8000);
        parsed.validate().unwrap();
    }
}
