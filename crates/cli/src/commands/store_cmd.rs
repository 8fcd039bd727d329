//! `kiln store`: inspect the conversation store.

use kiln_config::AppConfig;

pub async fn stats() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let store = kiln_store::open(&config.store).await?;
    let stats = store.stats().await?;

    println!("🗄️  Store ({})", store.name());
    println!("   Conversations:      {}", stats.conversation_count);
    println!("   Messages:           {}", stats.message_count);
    println!("   Active injections:  {}", stats.active_injection_count);
    Ok(())
}

pub async fn list(limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let store = kiln_store::open(&config.store).await?;
    let conversations = store.list_conversations().await?;

    if conversations.is_empty() {
        println!("No conversations stored yet.");
        return Ok(());
    }

    println!("🗄️  {} conversation(s)\n", conversations.len());
    for summary in conversations.iter().take(limit) {
        let conv = &summary.conversation;
        println!(
            "  {}  {:<24} {:>5} msgs  updated {}",
            conv.id,
            conv.name,
            summary.message_count,
            conv.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if conversations.len() > limit {
        println!("\n  ... {} more", conversations.len() - limit);
    }
    Ok(())
}
