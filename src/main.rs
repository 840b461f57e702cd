use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{self, LevelFilter, debug, info, error, warn};
use seqbench_pipelines::cli::parse;
use seqbench_pipelines::config::defs::{RunConfig, DOCKER_TAG};
use seqbench_pipelines::pipelines::batch;
use seqbench_pipelines::utils::command::check_version;
use seqbench_pipelines::utils::monitor::SystemProbe;
use seqbench_pipelines::utils::stage::ProcessExecutor;
use seqbench_pipelines::utils::system::{detect_cores_and_load, detect_ram};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n SeqBench\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    match detect_cores_and_load(args.threads).await {
        Ok((max_cores, cpu_load)) => debug!(
            "Detected {} usable physical cores for {} requested threads; CPU load {}%",
            max_cores, args.threads, cpu_load
        ),
        Err(e) => warn!("Could not detect CPU cores: {}", e),
    }
    match detect_ram() {
        Ok((total_ram, available_ram)) => {
            debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
            debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
        }
        Err(e) => warn!("Could not detect RAM: {}", e),
    }

    match check_version(DOCKER_TAG).await {
        Ok(version) => debug!("Using {} {}", DOCKER_TAG, version),
        Err(e) => warn!("{} check failed: {}. Parabricks stages will fail.", DOCKER_TAG, e),
    }

    let run_config = Arc::new(RunConfig::from_args(&args, &dir));
    let probe = Arc::new(SystemProbe::for_device(run_config.monitor_device));
    let executor = Arc::new(ProcessExecutor);

    match batch::run(run_config, executor, probe).await {
        Ok(outputs) => {
            info!(
                "{} samples: {} completed, {} skipped, {} failed. Report: {}",
                outputs.summary.total(),
                outputs.summary.completed,
                outputs.summary.skipped,
                outputs.summary.failed,
                outputs.merged_path.display()
            );
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
