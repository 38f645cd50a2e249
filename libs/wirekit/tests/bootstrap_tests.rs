#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests for wiring, lifecycle ordering and the single-active-
//! application rules.
//!
//! The active-application slot is process-global, so every test that boots
//! an application serializes on `boot_guard()`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use wirekit::{
    Application, BootstrapError, BootstrapOptions, ConfigSpec, Library, LifecycleStage,
    LoaderOptions, ServiceParams,
};

static BOOT_LOCK: Mutex<()> = Mutex::new(());

fn boot_guard() -> MutexGuard<'static, ()> {
    BOOT_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn hermetic_options() -> BootstrapOptions {
    BootstrapOptions {
        configuration: serde_json::Value::Null,
        loaders: LoaderOptions {
            file: false,
            env: false,
            cli: false,
            argv: Some(vec![]),
            ..Default::default()
        },
        handle_signals: false,
    }
}

#[tokio::test]
async fn factories_run_exactly_once_per_boot() {
    let _guard = boot_guard();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let lib = Library::builder("counting")
        .service("svc", move |_params: ServiceParams| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .build()
        .unwrap();

    let app = Application::builder("once-app").library(&lib).build().unwrap();

    app.bootstrap(hermetic_options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    app.teardown().await;

    // A torn-down application boots again; the factory runs once per boot.
    app.bootstrap(hermetic_options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    app.teardown().await;
}

#[tokio::test]
async fn double_bootstrap_is_rejected_and_first_stays_active() {
    let _guard = boot_guard();
    let app = Application::builder("twice-app").build().unwrap();

    app.bootstrap(hermetic_options()).await.unwrap();
    let err = app.bootstrap(hermetic_options()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::DoubleBoot { .. }));
    assert!(app.is_booted());

    app.teardown().await;
    assert!(!app.is_booted());
}

#[tokio::test]
async fn second_application_cannot_boot_while_first_is_active() {
    let _guard = boot_guard();
    let first = Application::builder("first-app").build().unwrap();
    let second = Application::builder("second-app").build().unwrap();

    first.bootstrap(hermetic_options()).await.unwrap();
    let err = second.bootstrap(hermetic_options()).await.unwrap_err();
    match err {
        BootstrapError::NoDualBoot { active } => assert_eq!(active, "first-app"),
        other => panic!("unexpected error: {other:?}"),
    }

    first.teardown().await;
    second.bootstrap(hermetic_options()).await.unwrap();
    second.teardown().await;
}

#[tokio::test]
async fn lifecycle_stages_run_in_documented_order() {
    let _guard = boot_guard();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    fn push(log: &Arc<Mutex<Vec<String>>>, entry: &str) {
        log.lock().unwrap().push(entry.to_owned());
    }

    let sink = log.clone();
    let lib = Library::builder("staged")
        .service("svc", move |params: ServiceParams| {
            let sink = sink.clone();
            async move {
                for (stage, tag) in [
                    (LifecycleStage::PreInit, "pre-init"),
                    (LifecycleStage::PostConfig, "post-config"),
                    (LifecycleStage::Bootstrap, "bootstrap"),
                    (LifecycleStage::Ready, "ready"),
                    (LifecycleStage::PreShutdown, "pre-shutdown"),
                    (LifecycleStage::ShutdownStart, "shutdown-start"),
                    (LifecycleStage::ShutdownComplete, "shutdown-complete"),
                ] {
                    let sink = sink.clone();
                    params.lifecycle().attach(stage, None, move || {
                        let sink = sink.clone();
                        async move {
                            push(&sink, tag);
                            Ok(())
                        }
                    });
                }
                Ok(None)
            }
        })
        .build()
        .unwrap();

    let app = Application::builder("staged-app").library(&lib).build().unwrap();
    app.bootstrap(hermetic_options()).await.unwrap();
    app.teardown().await;

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            "pre-init".to_owned(),
            "post-config".to_owned(),
            "bootstrap".to_owned(),
            "ready".to_owned(),
            "pre-shutdown".to_owned(),
            "shutdown-start".to_owned(),
            "shutdown-complete".to_owned(),
        ]
    );
}

#[tokio::test]
async fn prioritized_callbacks_run_before_unordered_within_a_stage() {
    let _guard = boot_guard();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = log.clone();
    let lib = Library::builder("ordering")
        .service("svc", move |params: ServiceParams| {
            let sink = sink.clone();
            async move {
                let s1 = sink.clone();
                params.lifecycle().attach(LifecycleStage::Ready, None, move || {
                    let s = s1.clone();
                    async move {
                        s.lock().unwrap().push("unordered");
                        Ok(())
                    }
                });
                let s2 = sink.clone();
                params.lifecycle().attach(LifecycleStage::Ready, Some(10), move || {
                    let s = s2.clone();
                    async move {
                        s.lock().unwrap().push("late-priority");
                        Ok(())
                    }
                });
                let s3 = sink.clone();
                params.lifecycle().attach(LifecycleStage::Ready, Some(-5), move || {
                    let s = s3.clone();
                    async move {
                        s.lock().unwrap().push("early-priority");
                        Ok(())
                    }
                });
                Ok(None)
            }
        })
        .build()
        .unwrap();

    let app = Application::builder("ordering-app").library(&lib).build().unwrap();
    app.bootstrap(hermetic_options()).await.unwrap();
    app.teardown().await;

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &["early-priority", "late-priority", "unordered"]
    );
}

#[tokio::test]
async fn peers_wired_earlier_are_visible() {
    let _guard = boot_guard();

    struct GreeterApi {
        greeting: &'static str,
    }

    let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let provider = Library::builder("provider")
        .service("greeter", |_params: ServiceParams| async move {
            Ok(Some(
                Arc::new(GreeterApi { greeting: "hello" }) as wirekit::ServiceApi
            ))
        })
        .build()
        .unwrap();

    let sink = observed.clone();
    let consumer = Library::builder("consumer")
        .depends_on(&provider)
        .service("caller", move |params: ServiceParams| {
            let sink = sink.clone();
            async move {
                let api = params.peers().get::<GreeterApi>("provider", "greeter")?;
                *sink.lock().unwrap() = Some(api.greeting.to_owned());
                Ok(None)
            }
        })
        .build()
        .unwrap();

    // Attached in the wrong order on purpose; the planner fixes it.
    let app = Application::builder("peer-app")
        .library(&consumer)
        .library(&provider)
        .build()
        .unwrap();

    app.bootstrap(hermetic_options()).await.unwrap();
    assert_eq!(observed.lock().unwrap().as_deref(), Some("hello"));
    app.teardown().await;
}

#[tokio::test]
async fn failing_factory_aborts_bootstrap_and_leaves_process_bootable() {
    let _guard = boot_guard();

    let lib = Library::builder("broken")
        .service("svc", |_params: ServiceParams| async move {
            anyhow::bail!("wiring exploded")
        })
        .build()
        .unwrap();

    let app = Application::builder("broken-app").library(&lib).build().unwrap();
    let err = app.bootstrap(hermetic_options()).await.unwrap_err();
    match err {
        BootstrapError::ServiceFactoryFailure { context, .. } => {
            assert_eq!(context, "broken:svc");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!app.is_booted());

    // The failed boot released the process slot.
    let healthy = Application::builder("healthy-app").build().unwrap();
    healthy.bootstrap(hermetic_options()).await.unwrap();
    healthy.teardown().await;
}

#[tokio::test]
async fn missing_dependency_fails_at_plan_time() {
    let _guard = boot_guard();

    let base = Library::builder("base").build().unwrap();
    let dependent = Library::builder("dependent").depends_on(&base).build().unwrap();

    // `base` is not attached.
    let app = Application::builder("plan-app").library(&dependent).build().unwrap();
    let err = app.bootstrap(hermetic_options()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::MissingDependency { .. }));
    assert!(!app.is_booted());
}

#[tokio::test(start_paused = true)]
async fn scheduler_entries_start_at_ready_and_stop_at_teardown() {
    let _guard = boot_guard();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    let lib = Library::builder("ticking")
        .service("pulse", move |params: ServiceParams| {
            let counter = counter.clone();
            async move {
                let counter = counter.clone();
                let _handle = params.scheduler().interval(Duration::from_secs(1), move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                });
                Ok(None)
            }
        })
        .build()
        .unwrap();

    let app = Application::builder("tick-app").library(&lib).build().unwrap();
    app.bootstrap(hermetic_options()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let after_ready = ticks.load(Ordering::SeqCst);
    assert_eq!(after_ready, 2);

    app.teardown().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_ready);
}

#[tokio::test]
async fn late_ready_attach_after_boot_still_runs() {
    let _guard = boot_guard();
    let ran = Arc::new(AtomicBool::new(false));

    let app = Application::builder("late-app").build().unwrap();
    app.bootstrap(hermetic_options()).await.unwrap();

    let flag = ran.clone();
    app.lifecycle().on_ready(move || {
        let flag = flag.clone();
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    });

    // Deferred work is drained on the executor.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert!(ran.load(Ordering::SeqCst));

    app.teardown().await;
}

#[tokio::test]
async fn library_config_reads_through_only_while_mounted() {
    let _guard = boot_guard();

    let lib = Library::builder("weather")
        .config("CURRENT_WEATHER", ConfigSpec::string().with_default("raining"))
        .build()
        .unwrap();
    let app = Application::builder("mount-app").library(&lib).build().unwrap();

    assert!(lib.get_config("CURRENT_WEATHER").is_none());
    app.bootstrap(hermetic_options()).await.unwrap();
    assert_eq!(
        lib.get_config("CURRENT_WEATHER").and_then(|v| v.as_str().map(String::from)),
        Some("raining".to_owned())
    );
    app.teardown().await;
    assert!(lib.get_config("CURRENT_WEATHER").is_none());
}

#[tokio::test]
async fn teardown_without_boot_is_a_noop() {
    let _guard = boot_guard();
    let app = Application::builder("noop-app").build().unwrap();
    app.teardown().await;
    assert!(!app.is_booted());
}
