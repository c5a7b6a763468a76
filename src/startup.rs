//! The environment-variable startup layer.
//!
//! All variables are optional. Invalid values are a startup-only hard error:
//! usage goes to stdout, the message to stderr, and the process exits. Once
//! the profiler is running, bad arguments to runtime operations are clamped
//! instead (see [`crate::session`]).

use std::env;

use log::LevelFilter;

use crate::features::Features;
use crate::session::{DEFAULT_INTERVAL_MS, DEFAULT_STARTUP_CAPACITY_ENTRIES};

pub(crate) const MAIN_THREAD_NAME: &str = "main";

pub(crate) struct StartupParams {
    pub capacity: u32,
    pub interval_ms: f64,
    pub features: Features,
    pub filters: Vec<String>,
    pub duration: Option<f64>,
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Map the logging variables to a `log` level and install a logger for it.
/// Verbosity 5 (`VERBOSE`) > 4 (`DEBUG`) > 3 (`LOGGING`) > off.
pub(crate) fn init_logging() {
    let level = if env::var_os("BASE_PROFILER_VERBOSE_LOGGING").is_some() {
        LevelFilter::Trace
    } else if env::var_os("BASE_PROFILER_DEBUG_LOGGING").is_some() {
        LevelFilter::Debug
    } else if env::var_os("BASE_PROFILER_LOGGING").is_some() {
        LevelFilter::Info
    } else {
        return;
    };
    // The embedding application may already have a logger; that one wins.
    let _ = env_logger::Builder::new().filter_level(level).try_init();
}

pub(crate) fn help_requested() -> bool {
    env::var_os("BASE_PROFILER_HELP").is_some()
}

pub(crate) fn shutdown_save_path() -> Option<String> {
    env_nonempty("BASE_PROFILER_SHUTDOWN")
}

/// Read the `BASE_PROFILER_STARTUP*` family. Returns `None` when startup
/// profiling is not requested. Exits the process on invalid values.
pub(crate) fn read_startup_params() -> Option<StartupParams> {
    let startup = env::var("BASE_PROFILER_STARTUP").ok()?;
    if startup.is_empty() || startup == "0" || startup == "N" || startup == "n" {
        return None;
    }
    log::info!("BASE_PROFILER_STARTUP is set");

    let mut capacity = DEFAULT_STARTUP_CAPACITY_ENTRIES;
    if let Some(value) = env_nonempty("BASE_PROFILER_STARTUP_ENTRIES") {
        match value.parse::<i64>() {
            Ok(entries) if entries > 0 && entries <= i32::MAX as i64 => {
                capacity = entries as u32;
                log::info!("BASE_PROFILER_STARTUP_ENTRIES = {capacity}");
            }
            _ => {
                eprintln!("BASE_PROFILER_STARTUP_ENTRIES is not a valid integer: {value}");
                print_usage_then_exit(1);
            }
        }
    }

    let mut duration = None;
    if let Some(value) = env_nonempty("BASE_PROFILER_STARTUP_DURATION") {
        match value.parse::<f64>() {
            Ok(seconds) if seconds >= 0.0 => {
                if seconds > 0.0 {
                    duration = Some(seconds);
                }
                log::info!("BASE_PROFILER_STARTUP_DURATION = {seconds}");
            }
            _ => {
                eprintln!("BASE_PROFILER_STARTUP_DURATION is not a valid number: {value}");
                print_usage_then_exit(1);
            }
        }
    }

    let mut interval_ms = DEFAULT_INTERVAL_MS;
    if let Some(value) = env_nonempty("BASE_PROFILER_STARTUP_INTERVAL") {
        match value.parse::<f64>() {
            Ok(interval) if interval > 0.0 && interval <= 1000.0 => {
                interval_ms = interval;
                log::info!("BASE_PROFILER_STARTUP_INTERVAL = {interval}");
            }
            _ => {
                eprintln!("BASE_PROFILER_STARTUP_INTERVAL is not a valid number: {value}");
                print_usage_then_exit(1);
            }
        }
    }

    let mut features = (Features::default_features() | Features::startup_extra_default_features())
        & Features::available_features();
    if let Some(value) = env_nonempty("BASE_PROFILER_STARTUP_FEATURES_BITFIELD") {
        match value.parse::<u32>() {
            Ok(bits) if bits != 0 => {
                features = Features::from_bits_truncate(bits);
                log::info!("BASE_PROFILER_STARTUP_FEATURES_BITFIELD = {bits}");
            }
            Ok(0) => {
                features = Features::empty();
                log::info!("BASE_PROFILER_STARTUP_FEATURES_BITFIELD = 0");
            }
            _ => {
                eprintln!("BASE_PROFILER_STARTUP_FEATURES_BITFIELD is not a valid integer: {value}");
                print_usage_then_exit(1);
            }
        }
    } else if let Some(value) = env_nonempty("BASE_PROFILER_STARTUP_FEATURES") {
        match Features::parse_names(value.split(','), true) {
            Ok(parsed) => {
                features = parsed;
                log::info!("BASE_PROFILER_STARTUP_FEATURES = {value}");
            }
            Err(unknown) => {
                eprintln!("Unrecognized feature \"{unknown}\".");
                print_usage_then_exit(1);
            }
        }
    }

    let filters = match env_nonempty("BASE_PROFILER_STARTUP_FILTERS") {
        Some(value) => value.split(',').map(str::to_string).collect(),
        None => vec![MAIN_THREAD_NAME.to_string()],
    };

    Some(StartupParams {
        capacity,
        interval_ms,
        features,
        filters,
        duration,
    })
}

fn feature_category(feature: Features) -> char {
    let available = Features::available_features().contains(feature);
    if Features::default_features().contains(feature) {
        if available {
            'D'
        } else {
            'd'
        }
    } else if Features::startup_extra_default_features().contains(feature) {
        if available {
            'S'
        } else {
            's'
        }
    } else if available {
        '-'
    } else {
        'x'
    }
}

pub(crate) fn print_usage_then_exit(exit_code: i32) -> ! {
    println!(
        "\n\
         Profiler environment variable usage:\n\
         \n\
           BASE_PROFILER_HELP\n\
           If set to any value, prints this message.\n\
         \n\
           BASE_PROFILER_{{,DEBUG_,VERBOSE_}}LOGGING\n\
           Enables logging. The levels of logging available are\n\
           'BASE_PROFILER_LOGGING' (least verbose), '..._DEBUG_LOGGING',\n\
           '..._VERBOSE_LOGGING' (most verbose).\n\
         \n\
           BASE_PROFILER_STARTUP\n\
           If set to any value other than '' or '0'/'N'/'n', starts the\n\
           profiler immediately on start-up.\n\
         \n\
           BASE_PROFILER_STARTUP_ENTRIES=<1..>\n\
           If BASE_PROFILER_STARTUP is set, specifies the number of entries\n\
           in the profiler's circular buffer when the profiler is first\n\
           started. Defaults to {startup_entries} entries (8 bytes each).\n\
         \n\
           BASE_PROFILER_STARTUP_DURATION=<seconds>\n\
           If BASE_PROFILER_STARTUP is set, specifies the maximum life time\n\
           of entries in the profiler's circular buffer, in seconds.\n\
           If unset, the life time of entries is only restricted by\n\
           BASE_PROFILER_STARTUP_ENTRIES.\n\
         \n\
           BASE_PROFILER_STARTUP_INTERVAL=<1..1000>\n\
           If BASE_PROFILER_STARTUP is set, specifies the sample interval,\n\
           measured in milliseconds. Defaults to {interval} ms.\n\
         \n\
           BASE_PROFILER_STARTUP_FEATURES_BITFIELD=<Number>\n\
           If BASE_PROFILER_STARTUP is set, specifies the profiling features\n\
           as the integer value of the features bitfield.\n\
           If unset, the value from BASE_PROFILER_STARTUP_FEATURES is used.\n\
         \n\
           BASE_PROFILER_STARTUP_FEATURES=<Features>\n\
           If BASE_PROFILER_STARTUP is set, specifies the profiling features\n\
           as a comma-separated list of strings.\n\
           Ignored if BASE_PROFILER_STARTUP_FEATURES_BITFIELD is set.\n\
         \n\
             Features: (x=unavailable, D/d=default/unavailable,\n\
                        S/s=startup extra default/unavailable)",
        startup_entries = DEFAULT_STARTUP_CAPACITY_ENTRIES,
        interval = DEFAULT_INTERVAL_MS,
    );
    for (feature, name, description) in Features::descriptions() {
        println!(
            "    {} {:5}: \"{}\" ({})",
            feature_category(feature),
            feature.bits(),
            name,
            description
        );
    }
    println!(
        "    -        \"default\" (All above D+S defaults)\n\
         \n\
           BASE_PROFILER_STARTUP_FILTERS=<Filters>\n\
           If BASE_PROFILER_STARTUP is set, specifies the thread filters as a\n\
           comma-separated list of strings. A given thread is sampled if any\n\
           of the filters is a case-insensitive substring of its name.\n\
         \n\
           BASE_PROFILER_SHUTDOWN=<path>\n\
           If set, the profiler saves a profile to the named file on\n\
           shutdown.\n\
         \n\
           This platform {} native unwinding.\n",
        if crate::sampler::native_unwind_supported() {
            "supports"
        } else {
            "does not support"
        }
    );
    std::process::exit(exit_code);
}
