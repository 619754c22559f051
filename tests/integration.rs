//! Integration tests for warden-plugin-runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_plugin_runtime::{
    CapabilityType, CodeArtifact, Error, Health, HookOutput, Invocation, LifecycleEvent,
    LifecycleState, ManifestBuilder, MonitorConfig, Operation, PerformanceMonitor,
    PerformanceSample, PluginManifest, PluginRegistry, RegistryConfig, ResolutionFailure,
    ResourceLimits, RiskLevel, Sandbox, SandboxViolation, StaticSource,
};

/// Sandbox double that echoes input. `failing_hook` fails `failures_left`
/// times before succeeding.
#[derive(Default)]
struct FakeSandbox {
    failing_hook: Option<(&'static str, &'static str)>,
    failures_left: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeSandbox {
    fn failing(plugin: &'static str, hook: &'static str, times: usize) -> Self {
        Self {
            failing_hook: Some((plugin, hook)),
            failures_left: AtomicUsize::new(times),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sandbox for FakeSandbox {
    fn run(
        &self,
        invocation: &Invocation<'_>,
        _limits: &ResourceLimits,
    ) -> Result<HookOutput, SandboxViolation> {
        self.calls
            .lock()
            .unwrap()
            .push((invocation.plugin.to_string(), invocation.operation.to_string()));

        if self.failing_hook == Some((invocation.plugin, invocation.operation))
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(SandboxViolation::NonZeroExit {
                code: 1,
                stderr: "boom".into(),
            });
        }

        Ok(HookOutput {
            stdout: String::from_utf8_lossy(invocation.input).into_owned(),
            ..HookOutput::default()
        })
    }
}

fn manifest(name: &str, deps: &[&str]) -> PluginManifest {
    deps.iter()
        .fold(
            ManifestBuilder::new(name, "1.0.0", CapabilityType::Feature)
                .entry_points(["init", "activate", "deactivate", "run"]),
            |b, d| b.depends_on(*d, "^1.0"),
        )
        .build()
        .unwrap()
}

fn clean() -> CodeArtifact {
    CodeArtifact::source("print('ok')").with_launcher(["/usr/bin/env", "true"])
}

fn registry_with(source: Arc<StaticSource>, sandbox: Arc<FakeSandbox>) -> PluginRegistry {
    PluginRegistry::builder(source)
        .sandbox(sandbox)
        .build()
        .unwrap()
}

#[test]
fn test_critical_plugin_excludes_its_dependents() {
    let source = Arc::new(StaticSource::new());
    source.add(
        manifest("p1", &[]),
        CodeArtifact::source("data = open('/etc/shadow').read()").with_launcher(["/usr/bin/env", "true"]),
    );
    source.add(manifest("p2", &["p1"]), clean());
    source.add(manifest("p3", &["p1"]), clean());

    let sandbox = Arc::new(FakeSandbox::default());
    let registry = registry_with(source, sandbox.clone());
    let report = registry.load_all().unwrap();

    let stats = registry.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.error, 3);
    assert!(sandbox.calls().is_empty());

    for name in ["p1", "p2", "p3"] {
        let error = report.failure(name).unwrap();
        assert!(error.to_string().contains("p1"), "{}: {}", name, error);
    }
    assert!(matches!(
        report.failure("p1"),
        Some(Error::SecurityRejection { .. })
    ));
    assert!(matches!(
        report.failure("p2"),
        Some(Error::DependencyUnresolved(ResolutionFailure::DependencyExcluded { .. }))
    ));

    let verdict = registry.security_verdict("p1").unwrap().unwrap();
    assert_eq!(verdict.risk_level(), RiskLevel::Critical);
    assert!(!verdict.allowed());
    assert_eq!(registry.quarantined().len(), 1);
    assert_eq!(registry.system_health().health, Health::Degraded);
}

#[test]
fn test_dependencies_activate_before_dependents() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("app", &["db", "cache"]), clean());
    source.add(manifest("cache", &["db"]), clean());
    source.add(manifest("db", &[]), clean());

    let sandbox = Arc::new(FakeSandbox::default());
    let registry = registry_with(source, sandbox.clone());
    let report = registry.load_all().unwrap();

    assert_eq!(report.loaded, vec!["db", "cache", "app"]);
    assert!(report.is_clean());

    let activations: Vec<String> = sandbox
        .calls()
        .into_iter()
        .filter(|(_, hook)| hook == "activate")
        .map(|(plugin, _)| plugin)
        .collect();
    assert_eq!(activations, vec!["db", "cache", "app"]);
}

#[test]
fn test_cycle_puts_both_plugins_in_error() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("a", &["b"]), clean());
    source.add(manifest("b", &["a"]), clean());
    source.add(manifest("solo", &[]), clean());

    let registry = registry_with(source, Arc::new(FakeSandbox::default()));
    let report = registry.load_all().unwrap();

    assert_eq!(report.loaded, vec!["solo"]);
    for name in ["a", "b"] {
        assert_eq!(registry.get(name).unwrap().state(), LifecycleState::Error);
        match report.failure(name) {
            Some(Error::DependencyUnresolved(ResolutionFailure::Cycle { path })) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()) && path.contains(&"b".to_string()));
            }
            other => panic!("expected cycle for {}, got {:?}", name, other),
        }
    }
}

#[test]
fn test_version_mismatch_reports_both_versions() {
    let source = Arc::new(StaticSource::new());
    source.add(
        ManifestBuilder::new("core", "1.4.0", CapabilityType::Service)
            .build()
            .unwrap(),
        clean(),
    );
    source.add(
        ManifestBuilder::new("ext", "1.0.0", CapabilityType::Feature)
            .depends_on("core", "^2.0")
            .build()
            .unwrap(),
        clean(),
    );

    let registry = registry_with(source, Arc::new(FakeSandbox::default()));
    let report = registry.load_all().unwrap();

    let message = report.failure("ext").unwrap().to_string();
    assert!(message.contains("^2.0"), "{}", message);
    assert!(message.contains("1.4.0"), "{}", message);
    assert_eq!(registry.get("core").unwrap().state(), LifecycleState::Active);
}

#[test]
fn test_illegal_transitions_leave_state_alone() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("widget", &[]), clean());

    let registry = PluginRegistry::builder(source)
        .sandbox(Arc::new(FakeSandbox::default()))
        .config(RegistryConfig::new().with_auto_activate(false))
        .build()
        .unwrap();
    registry.load_all().unwrap();
    assert_eq!(registry.get("widget").unwrap().state(), LifecycleState::Initialized);

    // Deactivate only applies to Active plugins.
    assert!(matches!(
        registry.deactivate("widget"),
        Err(Error::InvalidTransition { .. })
    ));
    assert_eq!(registry.get("widget").unwrap().state(), LifecycleState::Initialized);

    registry.activate("widget").unwrap();
    assert!(matches!(
        registry.unload("widget"),
        Err(Error::InvalidTransition { .. })
    ));

    registry.deactivate("widget").unwrap();
    registry.deactivate("widget").unwrap();
    assert_eq!(registry.get("widget").unwrap().state(), LifecycleState::Deactivated);

    registry.unload("widget").unwrap();
    let err = registry.activate("widget").unwrap_err();
    assert!(err.is_lifecycle());
    assert_eq!(registry.get("widget").unwrap().state(), LifecycleState::Unloaded);
}

#[test]
fn test_recover_reruns_failed_transition() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("flaky", &[]), clean());

    let sandbox = Arc::new(FakeSandbox::failing("flaky", "init", 1));
    let registry = registry_with(source, sandbox);

    let events = Arc::new(Mutex::new(Vec::<LifecycleEvent>::new()));
    let sink = events.clone();
    registry.on_event(move |event| sink.lock().unwrap().push(event.clone()));

    let report = registry.load_all().unwrap();
    assert!(matches!(report.failure("flaky"), Some(Error::HookFailed { .. })));

    let plugin = registry.get("flaky").unwrap();
    assert_eq!(plugin.state(), LifecycleState::Error);
    assert_eq!(plugin.last_stable_state(), LifecycleState::Loaded);
    assert!(plugin.error_cause().unwrap().contains("boom"));

    registry.recover("flaky").unwrap();
    assert_eq!(plugin.state(), LifecycleState::Initialized);
    registry.activate("flaky").unwrap();

    let transitions: Vec<(LifecycleState, LifecycleState)> =
        events.lock().unwrap().iter().map(|e| (e.from, e.to)).collect();
    assert_eq!(
        transitions,
        vec![
            (LifecycleState::Unloaded, LifecycleState::Loaded),
            (LifecycleState::Loaded, LifecycleState::Error),
            (LifecycleState::Error, LifecycleState::Initialized),
            (LifecycleState::Initialized, LifecycleState::Active),
        ]
    );
    assert_eq!(plugin.events().len(), 4);
}

#[test]
fn test_invoke_requires_active_plugin() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("echo", &[]), clean());

    let registry = registry_with(source, Arc::new(FakeSandbox::default()));
    registry.load_all().unwrap();

    let output = registry.invoke("echo", "run", b"ping").unwrap();
    assert_eq!(output.stdout, "ping");
    assert_eq!(registry.get("echo").unwrap().invocation_count(), 1);

    assert!(matches!(
        registry.invoke("echo", "missing", b""),
        Err(Error::HookFailed { .. })
    ));

    registry.deactivate("echo").unwrap();
    assert!(matches!(
        registry.invoke("echo", "run", b""),
        Err(Error::InvalidTransition { .. })
    ));

    let summary = registry.plugin_metrics("echo").unwrap();
    assert_eq!(summary.operation(Operation::Invoke).unwrap().count, 1);
}

#[test]
fn test_failure_rate_degrades_health() {
    let monitor = PerformanceMonitor::new(MonitorConfig::default());
    let alerts = Arc::new(AtomicUsize::new(0));
    let counter = alerts.clone();
    monitor.on_alert(move |alert| {
        assert_eq!(alert.health, Health::Degraded);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for i in 0..10 {
        monitor.record(PerformanceSample::new(
            "p",
            Operation::Invoke,
            Duration::from_millis(5),
            i >= 3,
        ));
    }

    let summary = monitor.snapshot("p").unwrap();
    assert_eq!(summary.sample_count, 10);
    assert_eq!(summary.failure_count, 3);
    assert_eq!(summary.health, Health::Degraded);

    let raised = monitor.evaluate();
    assert_eq!(raised.len(), 1);
    assert_eq!(alerts.load(Ordering::SeqCst), 1);

    // Unchanged health does not re-notify.
    monitor.evaluate();
    assert_eq!(alerts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_remove_forgets_plugin() {
    let source = Arc::new(StaticSource::new());
    source.add(manifest("temp", &[]), clean());

    let registry = registry_with(source, Arc::new(FakeSandbox::default()));
    registry.load_all().unwrap();
    assert_eq!(registry.capability_providers("feature:temp"), vec!["temp"]);

    registry.remove("temp").unwrap();
    assert!(!registry.contains("temp"));
    assert!(registry.capability_providers("feature:temp").is_empty());
    assert!(matches!(
        registry.plugin_detail("temp"),
        Err(Error::PluginNotFound(_))
    ));
}

#[cfg(feature = "serde")]
#[test]
fn test_malformed_documents_are_reported_not_loaded() {
    let source = Arc::new(StaticSource::new());
    source.push_document("broken.json", r#"{"version": "1.0.0"}"#, clean());
    source.push_document(
        "good.json",
        r#"{"name": "good", "version": "1.0.0", "capability_type": "feature"}"#,
        clean(),
    );

    let registry = registry_with(source, Arc::new(FakeSandbox::default()));
    let report = registry.load_all().unwrap();

    assert_eq!(report.loaded, vec!["good"]);
    assert_eq!(report.rejected_manifests.len(), 1);
    assert_eq!(report.rejected_manifests[0].origin, "broken.json");
    assert!(report.rejected_manifests[0].reason.contains("name"));

    let detail = registry.plugin_detail("good").unwrap();
    let json = serde_json::to_value(&detail).unwrap();
    assert_eq!(json["status"]["state"], "active");
}

#[cfg(unix)]
mod process {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Instant;
    use warden_plugin_runtime::{ConfigValueType, LifecycleConfig, ProcessSandbox, SandboxConfig};

    fn shell_plugin(name: &str, script: &str) -> (PluginManifest, CodeArtifact) {
        let manifest = ManifestBuilder::new(name, "1.0.0", CapabilityType::Feature)
            .entry_points(["init", "activate", "run"])
            .permission("network")
            .build()
            .unwrap();
        let artifact =
            CodeArtifact::source(script.to_string()).with_launcher(["/bin/sh", "-c", script, name]);
        (manifest, artifact)
    }

    fn process_registry(source: Arc<StaticSource>, lifecycle: LifecycleConfig) -> PluginRegistry {
        PluginRegistry::builder(source)
            .sandbox(Arc::new(ProcessSandbox::new(SandboxConfig::default())))
            .lifecycle(lifecycle)
            .build()
            .unwrap()
    }

    #[test]
    fn test_invoke_through_process_sandbox() {
        let (manifest, artifact) = shell_plugin(
            "shout",
            r#"if [ "$1" = run ]; then echo "@capability network"; tr a-z A-Z; fi"#,
        );
        let source = Arc::new(StaticSource::new());
        source.add(manifest, artifact);

        let registry = process_registry(source, LifecycleConfig::default());
        let report = registry.load_all().unwrap();
        assert!(report.is_clean(), "{:?}", report.failed);

        let output = registry.invoke("shout", "run", b"hello").unwrap();
        assert_eq!(output.stdout.trim(), "HELLO");
        assert_eq!(output.capabilities_used, vec!["network"]);
    }

    #[test]
    fn test_binary_artifact_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter");
        std::fs::write(&path, "#!/bin/sh\nif [ \"$1\" = count ]; then wc -c | tr -d ' '; fi\n").unwrap();

        let source = Arc::new(StaticSource::new());
        source.add(
            ManifestBuilder::new("counter", "1.0.0", CapabilityType::Middleware)
                .entry_points(["init", "count"])
                .build()
                .unwrap(),
            CodeArtifact::binary(&path).with_launcher(["/bin/sh".to_string(), path.display().to_string()]),
        );

        let registry = process_registry(source, LifecycleConfig::default());
        registry.load_all().unwrap();

        let output = registry.invoke("counter", "count", b"12345").unwrap();
        assert_eq!(output.stdout.trim(), "5");
        assert_eq!(
            registry.get("counter").unwrap().artifact_digest().map(|d| d.len()),
            Some(64)
        );
    }

    #[test]
    fn test_hung_init_times_out() {
        let (manifest, artifact) = shell_plugin(
            "sleepy",
            r#"if [ "$1" = init ]; then sleep 10; fi"#,
        );
        let source = Arc::new(StaticSource::new());
        source.add(manifest, artifact);

        let lifecycle = LifecycleConfig::new().with_operation_limits(
            Operation::Initialize,
            ResourceLimits::new().with_timeout(Duration::from_millis(200)),
        );
        let registry = process_registry(source, lifecycle);

        let started = std::time::Instant::now();
        let report = registry.load_all().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(matches!(
            report.failure("sleepy"),
            Some(Error::Sandbox(SandboxViolation::Timeout { .. }))
        ));
        assert_eq!(registry.get("sleepy").unwrap().state(), LifecycleState::Error);
    }

    fn wait_in_flight(registry: &PluginRegistry, name: &str, operation: Operation) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if registry.get(name).and_then(|p| p.in_flight()) == Some(operation) {
                return;
            }
            assert!(Instant::now() < deadline, "{} never started {}", name, operation);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_unload_cancels_running_init() {
        let (manifest, artifact) = shell_plugin(
            "sleepy",
            r#"if [ "$1" = init ]; then sleep 10; fi"#,
        );
        let source = Arc::new(StaticSource::new());
        source.add(manifest, artifact);
        let registry = process_registry(source, LifecycleConfig::default());

        let (report, elapsed) = std::thread::scope(|scope| {
            let pass = scope.spawn(|| registry.load_all());
            wait_in_flight(&registry, "sleepy", Operation::Initialize);

            let started = Instant::now();
            registry.unload("sleepy").unwrap();
            let elapsed = started.elapsed();
            (pass.join().unwrap().unwrap(), elapsed)
        });

        // Default grace period is 500ms.
        assert!(elapsed < Duration::from_millis(2000), "unload took {:?}", elapsed);
        assert!(matches!(
            report.failure("sleepy"),
            Some(Error::Sandbox(SandboxViolation::Cancelled))
        ));

        let plugin = registry.get("sleepy").unwrap();
        assert_eq!(plugin.state(), LifecycleState::Unloaded);
        let init: Vec<PerformanceSample> = plugin
            .metrics()
            .samples()
            .into_iter()
            .filter(|s| s.operation == Operation::Initialize)
            .collect();
        assert_eq!(init.len(), 1);
        assert!(!init[0].succeeded);
    }

    #[test]
    fn test_refused_unload_does_not_cancel_invoke() {
        let (manifest, artifact) = shell_plugin(
            "worker",
            r#"if [ "$1" = run ]; then sleep 1; echo done; fi"#,
        );
        let source = Arc::new(StaticSource::new());
        source.add(manifest, artifact);
        let registry = process_registry(source, LifecycleConfig::default());
        registry.load_all().unwrap();

        let output = std::thread::scope(|scope| {
            let invoke = scope.spawn(|| registry.invoke("worker", "run", b""));
            wait_in_flight(&registry, "worker", Operation::Invoke);

            assert!(matches!(
                registry.unload("worker"),
                Err(Error::InvalidTransition {
                    state: LifecycleState::Active,
                    ..
                })
            ));
            invoke.join().unwrap()
        });

        assert_eq!(output.unwrap().stdout.trim(), "done");
        assert_eq!(registry.get("worker").unwrap().state(), LifecycleState::Active);
    }

    #[test]
    fn test_hooks_receive_plugin_config() {
        let script = r#"case "$1" in
            configure) grep -q '^level=loud$' ;;
            run) printf '%s' "$PLUGIN_CONFIG" ;;
        esac"#;
        let manifest = ManifestBuilder::new("tuner", "1.0.0", CapabilityType::Feature)
            .entry_points(["activate", "run", "configure"])
            .config_key("level", ConfigValueType::String)
            .default_config("level", "quiet")
            .build()
            .unwrap();
        let artifact = CodeArtifact::source(script).with_launcher(["/bin/sh", "-c", script, "tuner"]);
        let source = Arc::new(StaticSource::new());
        source.add(manifest, artifact);
        let registry = process_registry(source, LifecycleConfig::default());
        registry.load_all().unwrap();

        let output = registry.invoke("tuner", "run", b"").unwrap();
        assert_eq!(output.stdout.trim(), "level=quiet");

        // The configure hook only accepts level=loud.
        let soft: BTreeMap<String, String> = [("level".to_string(), "soft".to_string())].into();
        assert!(registry.set_plugin_config("tuner", soft).is_err());
        assert_eq!(registry.plugin_config("tuner").unwrap()["level"], "quiet");

        let loud: BTreeMap<String, String> = [("level".to_string(), "loud".to_string())].into();
        registry.set_plugin_config("tuner", loud).unwrap();
        let output = registry.invoke("tuner", "run", b"").unwrap();
        assert_eq!(output.stdout.trim(), "level=loud");
    }
}
