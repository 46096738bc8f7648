use clap::{Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use libvulcan_chop::config::{Config, SplitterSource};
use libvulcan_chop::instrument::event_store::EventStore;
use libvulcan_chop::orchestrator::{ChopReduceOrchestrator, ChopReport};
use libvulcan_chop::worker_status::{BarColor, WorkerStatus};

const LOG_FILE_NAME: &str = "vulcan_chop.log";

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = match serde_yaml::to_string(&config) {
        Ok(y) => y,
        Err(e) => {
            log::error!("Could not serialize template config: {e}");
            return;
        }
    };
    match File::create(path).and_then(|mut file| file.write_all(yaml_str.as_bytes())) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Failed to write yaml data to file: {e}"),
    }
}

/// Command line values take precedence over the config file
fn apply_overrides(config: &mut Config, matches: &ArgMatches) -> Result<(), String> {
    if let Some(run) = matches.get_one::<String>("run") {
        config.run_number = run
            .parse()
            .map_err(|_| format!("Run number {run} is not an integer"))?;
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.output_dir = PathBuf::from(output);
    }
    if let Some(threads) = matches.get_one::<String>("threads") {
        config.n_threads = threads
            .parse()
            .map_err(|_| format!("Thread count {threads} is not an integer"))?;
    }
    if let Some(splitter) = matches.get_one::<String>("splitter") {
        config.splitter = SplitterSource::File {
            path: PathBuf::from(splitter),
        };
    }
    Ok(())
}

fn bar_message(status: &WorkerStatus) -> String {
    let stage = match status.color {
        BarColor::CYAN => "Focusing",
        BarColor::MAGENTA => "Splitting",
        BarColor::GREEN => "Writing",
        BarColor::RED => "Focusing (errors)",
    };
    format!(
        "Run {} batch {} worker {}: {stage}",
        status.run_number, status.batch, status.worker_id
    )
}

fn init_logging(pb_manager: &MultiProgress, output_dir: Option<&Path>) {
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(dir) = output_dir {
        if let Ok(file) = File::create(dir.join(LOG_FILE_NAME)) {
            loggers.push(simplelog::WriteLogger::new(
                simplelog::LevelFilter::Info,
                simplelog::Config::default(),
                file,
            ));
        }
    }
    let logger = simplelog::CombinedLogger::new(loggers);

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(simplelog::LevelFilter::Info);
}

fn print_report(report: &ChopReport) {
    log::info!(
        "Run {}: wrote {} GSAS files in {} batches",
        report.run_number,
        report.written.len(),
        report.n_batches
    );
    if !report.skipped.is_empty() {
        log::warn!(
            "{} chop intervals had no events and produced no file",
            report.skipped.len()
        );
    }
    for failure in report.failures.iter() {
        log::error!(
            "Unit {} ({}) failed: {}",
            failure.sequence_index,
            failure.workspace,
            failure.reason
        );
    }
    if let Some(lookup) = &report.lookup_file {
        log::info!("Lookup file: {}", lookup.to_string_lossy());
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("vulcan_chop_cli")
        .about("Chop a VULCAN event run and reduce every slice to GSAS")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file"),
        )
        .arg(Arg::new("run").long("run").help("Run number to chop"))
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Directory for the GSAS files"),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .help("Number of focus workers"),
        )
        .arg(
            Arg::new("splitter")
                .short('s')
                .long("splitter")
                .help("Splitter file to chop with"),
        )
        .get_matches();

    let pb_manager = MultiProgress::new();

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("A configuration path is required (-p/--path)");
            std::process::exit(1);
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        init_logging(&pb_manager, None);
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return;
    }

    // Load our config
    let mut config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = apply_overrides(&mut config, &matches) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    init_logging(&pb_manager, config.output_dir.is_dir().then_some(config.output_dir.as_path()));

    log::info!("Config successfully loaded from {}.", config_path.to_string_lossy());
    log::info!("Run Number: {} IPTS: {}", config.run_number, config.ipts);
    log::info!("Event File: {}", config.event_file.to_string_lossy());
    log::info!("Output Path: {}", config.output_dir.to_string_lossy());
    log::info!("Splitter: {:?}", config.splitter);
    log::info!(
        "Workers: {} Memory Ceiling: {}",
        config.n_threads,
        config.memory_ceiling
    );

    // Spawn the task!
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let handle = std::thread::spawn(move || {
        let mut orchestrator =
            ChopReduceOrchestrator::new(config, Arc::new(EventStore::new())).with_progress(tx);
        orchestrator.run()
    });

    let style = ProgressStyle::with_template("{msg:<40} [{bar:40}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<usize, ProgressBar> = HashMap::new();
    let mut success = false;
    loop {
        while let Ok(status) = rx.recv_timeout(Duration::from_millis(100)) {
            let bar = bars.entry(status.worker_id).or_insert_with(|| {
                let pb = pb_manager.add(ProgressBar::new(100));
                pb.set_style(style.clone());
                pb
            });
            bar.set_message(bar_message(&status));
            bar.set_position((status.progress * 100.0) as u64);
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(report) => {
                        print_report(&report);
                        success = report.is_success();
                    }
                    Err(e) => log::error!("Chopping failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join chopping task!"),
            }
            break;
        }
    }

    for bar in bars.values() {
        bar.finish();
    }

    log::info!("Done.");
    if !success {
        std::process::exit(1);
    }
}
