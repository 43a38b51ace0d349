//! # Application Entry Point
//!
//! Parses CLI arguments, initializes logging and the rayon pool, then
//! dispatches to imputation or one of the reference-conversion modes.
//! Exit code 0 on success, 1 on any failure.

use tracing_subscriber::EnvFilter;

use remac::config::Config;
use remac::error::Result;
use remac::io::reference::{compress_reference_panel, convert_old_m3vcf};
use remac::pipelines::ImputationPipeline;

fn run(config: Config) -> Result<()> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .thread_name(|i| format!("remac-worker-{}", i))
        .build_global()
        .map_err(|e| remac::RemacError::usage(format!("failed to create thread pool: {}", e)))?;

    if config.compress_reference {
        compress_reference_panel(
            config.ref_path(),
            &config.output,
            config.min_block_size,
            config.max_block_size,
            config.slope_unit,
            config.map.as_deref(),
        )
    } else if config.update_m3vcf {
        convert_old_m3vcf(config.ref_path(), &config.output, config.map.as_deref())
    } else {
        ImputationPipeline::new(config)?.run()
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = match Config::parse_and_validate() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
