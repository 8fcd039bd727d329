//! `kiln doctor`: diagnose config, database, and model setup.

use kiln_config::{AppConfig, StoreBackend};
use std::path::Path;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 kiln Doctor");
    println!("==============\n");

    let mut issues = 0;

    let config_path = AppConfig::config_path();
    let config = if config_path.exists() {
        match AppConfig::load() {
            Ok(config) => {
                println!("  ✅ Config file valid");
                config
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                println!("\n  ⚠️  Fix the config file before running other checks.");
                return Ok(());
            }
        }
    } else {
        println!("  ⚠️  No config file, using defaults (run `kiln onboard`)");
        issues += 1;
        AppConfig::default()
    };

    match config.store.backend {
        StoreBackend::Memory => {
            println!("  ⚠️  Memory store: conversations are lost on restart");
        }
        StoreBackend::Sqlite => {
            let dir = config.store.path.parent().unwrap_or(Path::new("."));
            if dir.as_os_str().is_empty() || dir.exists() {
                println!("  ✅ Database directory ready: {}", config.store.path.display());
            } else {
                println!(
                    "  ⚠️  Database directory missing: {} (created on first start)",
                    dir.display()
                );
            }
        }
    }

    let runtime = kiln_inference::default_runtime();
    if runtime.name() == "unavailable" {
        println!("  ❌ No model runtime compiled in, rebuild with `--features local`");
        issues += 1;
    } else {
        println!("  ✅ Model runtime: {}", runtime.name());
    }

    match &config.model.path {
        None => println!("  ⚠️  No startup model configured, load one via POST /models/load"),
        Some(model) if Path::new(model).exists() => {
            println!("  ✅ Startup model file found: {model}");
        }
        Some(model) => {
            let preset = runtime
                .available_models()
                .iter()
                .any(|m| m.name.eq_ignore_ascii_case(model));
            if preset {
                println!("  ✅ Startup model is a preset: {model}");
            } else {
                println!("  ❌ Startup model not found: {model}");
                issues += 1;
            }
        }
    }

    if config.routing.enabled {
        println!(
            "  ℹ️  Routing enabled ({:?}), peer at {}",
            config.routing.mode,
            config.routing.endpoint()
        );
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
