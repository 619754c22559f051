//! Walkthrough of discovery, scanning, ordering and invocation.
//!
//! Runs small `/bin/sh` plugins through the process sandbox.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use warden_plugin_runtime::{
    CapabilityType, CodeArtifact, ConfigValueType, LifecycleConfig, ManifestBuilder, MonitorConfig, Operation,
    PluginRuntime, RegistryConfig, ResourceLimits, RuntimeConfig, StaticSource,
};

fn shell(script: &str, name: &str) -> CodeArtifact {
    CodeArtifact::source(script.to_string()).with_launcher(["/bin/sh", "-c", script, name])
}

fn main() -> warden_plugin_runtime::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Registry Tour ===\n");

    let source = Arc::new(StaticSource::new());

    source.add(
        ManifestBuilder::new("store", "1.2.0", CapabilityType::Service)
            .description("Key-value store")
            .provides("kv")
            .priority(10)
            .entry_points(["init", "get"])
            .config_key("prefix", ConfigValueType::String)
            .default_config("prefix", "value-for")
            .build()?,
        shell(
            r#"if [ "$1" = get ]; then prefix=$(printf '%s' "$PLUGIN_CONFIG" | sed -n 's/^prefix=//p'); echo "$prefix-$(cat)"; fi"#,
            "store",
        ),
    );

    source.add(
        ManifestBuilder::new("greeter", "0.3.0", CapabilityType::Feature)
            .depends_on("store", "^1.0")
            .permission("network")
            .entry_points(["init", "activate", "greet"])
            .build()?,
        shell(
            r#"if [ "$1" = greet ]; then echo "@capability network"; echo "hello, $(cat)"; fi"#,
            "greeter",
        ),
    );

    source.add(
        ManifestBuilder::new("wiper", "0.0.1", CapabilityType::Feature)
            .entry_point("init")
            .build()?,
        shell("rm -rf / --no-preserve-root", "wiper"),
    );

    source.add(
        ManifestBuilder::new("orphan", "1.0.0", CapabilityType::Feature)
            .depends_on("ghost", "^1")
            .build()?,
        shell("true", "orphan"),
    );

    let config = RuntimeConfig::new()
        .with_registry(RegistryConfig::new().with_auto_activate(true))
        .with_lifecycle(LifecycleConfig::new().with_operation_limits(
            Operation::Invoke,
            ResourceLimits::new().with_timeout(Duration::from_secs(2)),
        ))
        .with_monitor(MonitorConfig::new().with_poll_interval(Duration::from_millis(250)));

    let runtime = PluginRuntime::new(config, source)?;
    let report = runtime.start()?;

    println!("Loaded: {:?}", report.loaded);
    for failure in &report.failed {
        println!("Failed: {} - {}", failure.plugin, failure.error);
    }

    println!("\n=== Plugins ===");
    for status in runtime.registry().list() {
        println!(
            "  {:<8} {:<6} {:<12} risk={:?}",
            status.name, status.version, status.state, status.risk_level
        );
    }

    println!("\n=== Quarantine ===");
    for entry in runtime.registry().quarantined() {
        println!("  {}: {}", entry.plugin, entry.reason);
    }

    println!("\n=== Invocations ===");
    let output = runtime.registry().invoke("store", "get", b"answer")?;
    println!("  store.get    -> {}", output.stdout.trim());
    let output = runtime.registry().invoke("greeter", "greet", b"world")?;
    println!(
        "  greeter.greet -> {} (capabilities used: {:?})",
        output.stdout.trim(),
        output.capabilities_used
    );

    let prefix: BTreeMap<String, String> = [("prefix".to_string(), "cached".to_string())].into();
    runtime.registry().set_plugin_config("store", prefix)?;
    let output = runtime.registry().invoke("store", "get", b"answer")?;
    println!("  store.get    -> {} (after reconfiguring)", output.stdout.trim());

    println!("\n=== Capabilities ===");
    for capability in runtime.registry().capabilities().capabilities() {
        println!(
            "  {:<18} {:?}",
            capability,
            runtime.registry().capability_providers(&capability)
        );
    }

    let health = runtime.health();
    println!("\n=== Health ===");
    println!("  overall: {}", health.health);
    println!("  errored: {:?}", health.errored);
    println!("  stats:   {:?}", health.stats);

    runtime.shutdown();
    println!("\nShutdown complete");

    Ok(())
}
