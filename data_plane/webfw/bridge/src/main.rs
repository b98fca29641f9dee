//! # Web Firewall Bridge Entry Point
//!
//! Opens the persisted state, restores the last mode into the local engine
//! and serves the message API.

use std::sync::Arc;

use bridge::{
    start_message_server, BridgeConfig, LocalEngine, MatchPump, MessageServer, SqliteStore, StaticManifest,
};
use rule_engine::store::KEY_MODE;
use rule_engine::{
    match_channel, ControllerConfig, KeyValueStore, MessageHandler, ModeController, PresetCatalog,
    StateStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=================================================");
    println!("  Web Firewall - Rule Lifecycle Bridge           ");
    println!("=================================================");
    println!();

    let config = BridgeConfig::from_env();

    let sqlite = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("✗ Failed to open state database: {}", e);
            return Err(e.into());
        }
    };
    let first_install = sqlite.get(KEY_MODE).await?.is_none();
    println!("✓ State database: {}", config.db_path.display());

    let presets = match PresetCatalog::load(config.presets_path.as_deref()) {
        Ok(presets) => presets,
        Err(e) => {
            eprintln!("✗ {}", e);
            return Err(e.into());
        }
    };
    println!(
        "✓ Presets: {} balanced, {} paranoid (sha256 {})",
        presets.balanced().len(),
        presets.paranoid().len(),
        presets.digest()
    );

    let (matches_tx, matches_rx) = match_channel();
    let engine = Arc::new(LocalEngine::new(
        StaticManifest::reserved(config.static_rules),
        Some(matches_tx),
    )?);
    println!("✓ Local engine: {} static rules", config.static_rules);

    let controller = Arc::new(ModeController::new(
        ControllerConfig::default(),
        StateStore::new(sqlite),
        engine.clone(),
        presets,
    ));
    if first_install {
        println!("First start: seeding defaults");
        controller.install().await?;
    } else {
        controller.restore_state().await?;
    }

    let state = controller.get_state().await?;
    println!("  - Mode: {}", state.mode);
    println!("  - Enabled: {}", controller.cached_state().enabled);
    println!("  - Blocked so far: {}", state.blocked_count);
    println!("  - Dynamic rules: {}", engine.dynamic_count());
    println!();

    let pump = MatchPump::new(controller.clone(), matches_rx).spawn();

    println!("Starting message server...");
    println!("  - Listening on: {}", config.listen_addr);
    println!();

    let server = MessageServer::new(MessageHandler::new(controller), engine);
    start_message_server(server, &config.listen_addr).await?;

    pump.abort();
    println!("=================================================");
    println!("  Bridge Shut Down");
    println!("=================================================");

    Ok(())
}
