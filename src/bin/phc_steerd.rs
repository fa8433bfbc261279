//! Daemon frontend: argument parsing, configuration loading, logging setup
//! and signal handling around the steering loop.

use std::env;
use std::io::Write;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use log::{info, LevelFilter};

use phc_steering::config::{Config, LogOptions};
use phc_steering::registry::SlaveRegistry;
use phc_steering::source;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_term(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn install_signal_handlers() {
    let handler = handle_term as extern "C" fn(libc::c_int);
    // # Safety
    //
    // The handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn usage(progname: &str) {
    eprintln!(
        "\n\
         usage: {progname} [options]\n\n\
         -c [dev|name]  slave PHC (like /dev/ptp0 or eth0), repeatable\n\
         -f [file]      read configuration from 'file'\n\
         -h             prints this message and exits\n\
         -l [num]       set the logging level to 'num' (6)\n\
         -m             print messages to stdout\n\
         -q             do not print messages to the syslog\n\
         -s [dev|name]  source of the PPS signal\n\
         \x20              may take any of the following forms:\n\
         \x20                  generic   - an external 1-PPS without ToD information\n\
         \x20                  /dev/ptpN - a local PHC generating the 1-PPS itself\n\
         -v             prints the software version and exits\n"
    );
}

fn init_logging(options: &LogOptions) {
    let level = match options.level {
        0..=3 => LevelFilter::Error,
        4 => LevelFilter::Warn,
        5 | 6 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if options.verbose {
        builder.target(env_logger::Target::Stdout);
    }
    if let Some(tag) = options.message_tag.clone() {
        builder.format(move |buf, record| {
            writeln!(buf, "{tag} [{}] {}", record.level(), record.args())
        });
    }
    builder.init();
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let progname = args[0].rsplit('/').next().unwrap_or("phc-steerd").to_string();

    let mut slaves: Vec<String> = Vec::new();
    let mut pps_source: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut level: Option<u32> = None;
    let mut verbose = false;
    let mut quiet = false;

    let required = |i: usize, flag: &str| -> String {
        match args.get(i + 1) {
            Some(value) => value.clone(),
            None => {
                eprintln!("{progname}: option {flag} requires an argument");
                process::exit(1);
            }
        }
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" => {
                slaves.push(required(i, "-c"));
                i += 1;
            }
            "-s" => {
                pps_source = Some(required(i, "-s"));
                i += 1;
            }
            "-f" => {
                config_path = Some(required(i, "-f"));
                i += 1;
            }
            "-l" => {
                let value = required(i, "-l");
                match value.parse() {
                    Ok(parsed) => level = Some(parsed),
                    Err(_) => {
                        eprintln!("{progname}: invalid logging level {value}");
                        process::exit(1);
                    }
                }
                i += 1;
            }
            "-m" => verbose = true,
            "-q" => quiet = true,
            "-v" => {
                println!("{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-h" => {
                usage(&progname);
                return Ok(());
            }
            other => {
                eprintln!("{progname}: unknown option {other}");
                usage(&progname);
                process::exit(1);
            }
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => {
            Config::read(path).with_context(|| format!("cannot read configuration file {path}"))?
        }
        None => Config::new(),
    };
    if verbose {
        config.log.verbose = true;
    }
    if quiet {
        // accepted for compatibility; messages never go to the syslog anyway
        config.log.use_syslog = false;
    }
    if let Some(level) = level {
        config.log.level = level;
    }

    let Some(pps_source) = pps_source else {
        usage(&progname);
        process::exit(1);
    };
    if slaves.is_empty() {
        usage(&progname);
        process::exit(1);
    }

    init_logging(&config.log);
    install_signal_handlers();

    let source = source::open_source(&pps_source, config.perout_period_s)
        .with_context(|| format!("cannot open PPS source {pps_source}"))?;

    let mut registry = SlaveRegistry::new();
    for device in &slaves {
        let options = config.slave_options(device);
        registry
            .add(&options, device)
            .with_context(|| format!("cannot set up slave clock {device}"))?;
    }

    info!(
        "steering {} clock(s) against {}",
        registry.len(),
        pps_source
    );

    registry.run(source.as_ref(), &|| RUNNING.load(Ordering::Acquire))?;

    info!("shutting down");
    Ok(())
}
