//! End-to-end scenarios against the public API.
//!
//! The profiler is process-global state, so every test takes `serialize()`
//! first and pairs `init` with `shutdown` before releasing it.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use serde_json::{json, Value};
use stackpulse::{Category, CounterSample, CounterSource, Features, MarkerPayload, StackCollector};

static GUARD: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// Spawn a thread that registers itself under `name` and idles until told to
/// finish. Returns after the registration is visible.
fn spawn_registered(name: &'static str) -> Worker {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (ready_sender, ready_receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        stackpulse::register_thread(name, 0);
        ready_sender.send(()).unwrap();
        while !stop_flag.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(1));
        }
        stackpulse::unregister_thread();
    });
    ready_receiver.recv().unwrap();
    Worker { handle, stop }
}

impl Worker {
    fn finish(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap();
    }
}

fn profile_json() -> Value {
    let json = stackpulse::get_profile(0.0, false).expect("session should be active");
    serde_json::from_str(&json).expect("profile should be valid JSON")
}

fn thread_names(profile: &Value) -> Vec<String> {
    profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

/// Markers of one thread as (name, time, category) triples.
fn markers_of(profile: &Value, thread_name: &str) -> Vec<(String, f64, u64)> {
    let thread = profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == thread_name)
        .unwrap_or_else(|| panic!("no thread named {thread_name}"));
    let strings = thread["stringTable"].as_array().unwrap();
    thread["markers"]["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| {
            let name_index = row[0].as_u64().unwrap() as usize;
            (
                strings[name_index].as_str().unwrap().to_string(),
                row[1].as_f64().unwrap(),
                row[2].as_u64().unwrap(),
            )
        })
        .collect()
}

#[test]
fn startup_via_environment() {
    let _guard = serialize();
    std::env::set_var("BASE_PROFILER_STARTUP", "1");
    std::env::set_var("BASE_PROFILER_STARTUP_ENTRIES", "4096");
    std::env::set_var("BASE_PROFILER_STARTUP_INTERVAL", "10");
    std::env::set_var("BASE_PROFILER_STARTUP_FEATURES_BITFIELD", "0");

    stackpulse::init(0);
    std::env::remove_var("BASE_PROFILER_STARTUP");
    std::env::remove_var("BASE_PROFILER_STARTUP_ENTRIES");
    std::env::remove_var("BASE_PROFILER_STARTUP_INTERVAL");
    std::env::remove_var("BASE_PROFILER_STARTUP_FEATURES_BITFIELD");

    assert!(stackpulse::is_active());
    let params = stackpulse::get_start_params().unwrap();
    assert_eq!(params.interval_ms, 10.0);

    let profile = profile_json();
    assert_eq!(profile["meta"]["version"], 19);
    assert_eq!(profile["meta"]["interval"], 10.0);
    assert_eq!(profile["meta"]["processType"], 0);
    assert_eq!(profile["meta"]["shutdownTime"], Value::Null);
    assert_eq!(
        profile["meta"]["categories"].as_array().unwrap().len(),
        5
    );

    stackpulse::shutdown();
    assert!(!stackpulse::is_active());
}

#[test]
fn filters_select_threads_for_sampling() {
    let _guard = serialize();
    stackpulse::init(0);

    let workers = vec![
        spawn_registered("Worker#1"),
        spawn_registered("io"),
        spawn_registered("render"),
    ];

    stackpulse::start(1 << 20, 2.0, Features::default_features(), &["worker"], None);
    thread::sleep(Duration::from_millis(30));

    let profile = profile_json();
    let names = thread_names(&profile);
    assert_eq!(names, vec!["Worker#1".to_string()]);

    stackpulse::stop();
    for worker in workers {
        worker.finish();
    }
    stackpulse::shutdown();
}

#[test]
fn samples_carry_label_frames() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 2.0, Features::default_features(), &[], None);

    {
        let _scope = stackpulse::enter_label("crunch", "batch 7", Category::Runtime);
        thread::sleep(Duration::from_millis(40));
    }

    let profile = profile_json();
    let main = profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "main")
        .expect("main thread should be present");
    assert!(
        main["samples"]["data"].as_array().unwrap().len() >= 2,
        "expected several samples over 40ms at a 2ms interval"
    );
    assert_json_eq!(main["samples"]["schema"], json!({ "stack": 0, "time": 1 }));
    let strings = main["stringTable"].as_array().unwrap();
    assert!(
        strings.iter().any(|s| s == "crunch batch 7"),
        "expected the label frame in the string table, got {strings:?}"
    );

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn dead_threads_age_out_of_the_profile() {
    let _guard = serialize();
    stackpulse::init(0);
    // Small buffer (8192 entries = 64 KiB) so it can be wrapped quickly.
    stackpulse::start(8192, 2.0, Features::default_features(), &[], None);

    let worker = spawn_registered("ephemeral");
    thread::sleep(Duration::from_millis(10));
    worker.finish();

    // The record sticks around right after unregistration.
    let profile = profile_json();
    assert!(thread_names(&profile).contains(&"ephemeral".to_string()));

    // Push enough marker data through the ring to wrap past the record's
    // unregister position.
    for i in 0..4096 {
        stackpulse::text_marker("filler", format!("padding row {i}"), Category::Other);
    }

    let profile = profile_json();
    assert!(
        !thread_names(&profile).contains(&"ephemeral".to_string()),
        "dead thread should have aged out after the buffer wrapped"
    );

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn about_blank_page_is_replaced() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    stackpulse::register_page(1, 100, "about:blank", 0);
    stackpulse::register_page(1, 100, "https://example.com/", 0);

    let profile = profile_json();
    let pages = profile["pages"].as_array().unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0]["url"], "https://example.com/");
    assert_eq!(pages[0]["innerWindowID"], 100);

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn restarting_replaces_session_parameters() {
    let _guard = serialize();
    stackpulse::init(0);

    stackpulse::start(8192, 5.0, Features::default_features(), &[], None);
    assert_eq!(stackpulse::get_start_params().unwrap().capacity, 8192);

    // A second start stops the first session; the old sampler task exits on
    // its next iteration via the generation check.
    stackpulse::start(16384, 5.0, Features::default_features(), &[], None);
    let params = stackpulse::get_start_params().unwrap();
    assert_eq!(params.capacity, 16384);
    assert!(stackpulse::is_active());

    // Identical parameters: ensure_started leaves the session alone.
    stackpulse::ensure_started(16384, 5.0, Features::default_features(), &[], None);
    assert_eq!(stackpulse::get_start_params().unwrap().capacity, 16384);

    stackpulse::stop();
    assert!(!stackpulse::is_active());
    stackpulse::shutdown();
}

#[test]
fn marker_round_trip() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    let before = stackpulse::profiler_time();
    stackpulse::add_marker("net request", Category::Io, None);
    let after = stackpulse::profiler_time();

    let markers = markers_of(&profile_json(), "main");
    let (_, time, category) = markers
        .iter()
        .find(|(name, _, _)| name == "net request")
        .expect("marker should be in the profile");
    assert!(*time >= before && *time <= after);
    assert_eq!(*category, Category::Io as u64);

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn markers_are_rejected_while_paused() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    stackpulse::pause();
    assert!(stackpulse::is_paused());
    stackpulse::add_marker("while paused", Category::Other, None);
    stackpulse::resume();
    assert!(!stackpulse::is_paused());
    stackpulse::add_marker("after resume", Category::Other, None);

    let profile = profile_json();
    let markers = markers_of(&profile, "main");
    assert!(!markers.iter().any(|(name, _, _)| name == "while paused"));
    assert!(markers.iter().any(|(name, _, _)| name == "after resume"));

    let ranges = profile["pausedRanges"].as_array().unwrap();
    let paused = ranges
        .iter()
        .find(|r| r["reason"] == "profiler-paused")
        .expect("a paused range should be recorded");
    assert!(paused["startTime"].as_f64().unwrap() <= paused["endTime"].as_f64().unwrap());

    stackpulse::stop();
    stackpulse::shutdown();
}

struct TestCounter {
    value: AtomicI64,
}

impl CounterSource for TestCounter {
    fn name(&self) -> &str {
        "memory"
    }

    fn category(&self) -> &str {
        "Memory"
    }

    fn description(&self) -> &str {
        "Bytes allocated minus bytes freed"
    }

    fn sample(&self) -> CounterSample {
        CounterSample {
            count: self.value.fetch_add(64, Ordering::Relaxed),
            number: 1,
        }
    }
}

#[test]
fn counters_are_sampled_each_iteration() {
    let _guard = serialize();
    stackpulse::init(0);

    let counter = Arc::new(TestCounter {
        value: AtomicI64::new(0),
    });
    stackpulse::add_sampled_counter(counter.clone());

    stackpulse::start(1 << 20, 5.0, Features::default_features(), &[], None);
    thread::sleep(Duration::from_millis(60));

    let profile = profile_json();
    let counters = profile["counters"].as_array().unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0]["name"], "memory");
    assert_eq!(counters[0]["category"], "Memory");
    let rows = counters[0]["sample_groups"][0]["samples"]["data"]
        .as_array()
        .unwrap();
    assert!(
        !rows.is_empty(),
        "expected counter rows after several intervals"
    );
    // Rows are [time, count, number] with non-decreasing times.
    let times: Vec<f64> = rows.iter().map(|r| r[0].as_f64().unwrap()).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    stackpulse::stop();
    let source: Arc<dyn CounterSource> = counter;
    stackpulse::remove_sampled_counter(&source);
    stackpulse::shutdown();
}

struct CollectingStack {
    labels: Vec<String>,
    leaves: Vec<u64>,
    saw_main: bool,
}

impl StackCollector for CollectingStack {
    fn set_is_main_thread(&mut self) {
        self.saw_main = true;
    }

    fn collect_native_leaf_addr(&mut self, address: u64) {
        self.leaves.push(address);
    }

    fn collect_label_frame(&mut self, label: &str, _dynamic: &str, _category: Category) {
        self.labels.push(label.to_string());
    }
}

#[test]
fn backtrace_samples_go_to_the_collector_only() {
    let _guard = serialize();
    stackpulse::init(0);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (tid_sender, tid_receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        stackpulse::register_thread("observed", 0);
        let _scope = stackpulse::enter_label("observed work", "", Category::Runtime);
        tid_sender.send(stackpulse::profiler_current_thread_id()).unwrap();
        while !stop_flag.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(1));
        }
        stackpulse::unregister_thread();
    });
    let tid = tid_receiver.recv().unwrap();

    // Works without any active session.
    let mut collector = CollectingStack {
        labels: Vec::with_capacity(64),
        leaves: Vec::with_capacity(64),
        saw_main: false,
    };
    stackpulse::suspend_and_sample_thread(tid, Features::empty(), &mut collector, false);
    assert!(collector.labels.iter().any(|l| l == "observed work"));
    assert!(!collector.saw_main);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    stackpulse::shutdown();
}

#[test]
fn backtrace_attaches_to_marker() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    let _scope = stackpulse::enter_label("compress", "", Category::Runtime);
    let backtrace = stackpulse::get_backtrace().expect("backtrace should be available");
    assert!(backtrace
        .frame_locations()
        .iter()
        .any(|f| f == "compress"));

    stackpulse::add_marker(
        "slow call",
        Category::Runtime,
        Some(MarkerPayload::text("34ms").with_cause(&backtrace)),
    );

    let profile = profile_json();
    let main = profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "main")
        .unwrap();
    let strings = main["stringTable"].as_array().unwrap();
    let row = main["markers"]["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|row| strings[row[0].as_u64().unwrap() as usize] == "slow call")
        .expect("marker should be present");
    let stack = row[3]["stack"].as_array().unwrap();
    assert!(stack.iter().any(|f| f == "compress"));
    assert_eq!(row[3]["type"], "Text");

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn exit_profiles_are_spliced_into_saved_files() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    stackpulse::add_exit_profile(r#"{"meta":{"version":19},"threads":[]}"#);

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("profile.json");
    stackpulse::save_profile_to_file(&path);

    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let processes = saved["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0]["meta"]["version"], 19);

    // Saving drained the gathered exit profiles.
    assert!(stackpulse::move_exit_profiles().is_empty());

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn privacy_feature_blocks_markers_and_backtraces() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(
        1 << 20,
        10.0,
        Features::default_features() | Features::PRIVACY,
        &[],
        None,
    );

    assert!(stackpulse::is_active());
    stackpulse::add_marker("private", Category::Other, None);
    assert!(stackpulse::get_backtrace().is_none());

    let markers = markers_of(&profile_json(), "main");
    assert!(markers.is_empty());

    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn sleeping_threads_duplicate_their_last_sample() {
    let _guard = serialize();
    stackpulse::init(0);

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (ready_sender, ready_receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        stackpulse::register_thread("sleeper", 0);
        let _scope = stackpulse::enter_label("wait loop", "", Category::Idle);
        ready_sender.send(()).unwrap();
        stackpulse::thread_sleep();
        while !stop_flag.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(1));
        }
        stackpulse::thread_wake();
        stackpulse::unregister_thread();
    });
    ready_receiver.recv().unwrap();

    stackpulse::start(1 << 20, 2.0, Features::default_features(), &[], None);
    thread::sleep(Duration::from_millis(40));

    let profile = profile_json();
    let sleeper = profile["threads"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "sleeper")
        .expect("sleeper thread should be present");
    assert!(
        sleeper["samples"]["data"].as_array().unwrap().len() >= 2,
        "duplicated samples should keep accumulating while asleep"
    );

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
    stackpulse::stop();
    stackpulse::shutdown();
}

#[test]
fn unregistered_threads_are_invisible_to_markers() {
    let _guard = serialize();
    stackpulse::init(0);
    stackpulse::start(1 << 20, 10.0, Features::default_features(), &[], None);

    let (done_sender, done_receiver) = mpsc::channel();
    thread::spawn(move || {
        // Never registered: the marker must be dropped silently.
        stackpulse::add_marker("ghost", Category::Other, None);
        done_sender.send(()).unwrap();
    });
    done_receiver.recv().unwrap();

    let profile = profile_json();
    for thread in profile["threads"].as_array().unwrap() {
        let name = thread["name"].as_str().unwrap().to_string();
        let markers = markers_of(&profile, &name);
        assert!(!markers.iter().any(|(name, _, _)| name == "ghost"));
    }

    stackpulse::stop();
    stackpulse::shutdown();
}
