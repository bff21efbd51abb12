use clap::Parser;
use labpuller::{
    config::{default_cache_file, Config},
    prepull::KubeCluster,
    registry::UreqClient,
    Prepuller, ScanRepo,
};
use std::{path::PathBuf, sync::Arc};

#[derive(Debug, Parser)]
#[clap(version)]
enum Opt {
    /// Scan the repository and print the selected images
    Scan {
        /// Path of the configuration file
        #[clap(short = 'c', long = "config", parse(from_os_str))]
        config: Option<PathBuf>,

        /// Print the selected tags as JSON instead of shell variables
        #[clap(long = "json")]
        json: bool,

        #[clap(long = "debug")]
        debug: bool,
    },

    /// Pull the selected images on every eligible node
    Prepull {
        /// Path of the configuration file
        #[clap(short = 'c', long = "config", parse(from_os_str))]
        config: Option<PathBuf>,

        /// Only pull the images listed in the configuration
        #[clap(long = "no-scan")]
        no_scan: bool,

        #[clap(long = "debug")]
        debug: bool,
    },
}

fn init_logger(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if config.scan.cache_file.is_none() {
        config.scan.cache_file = Some(default_cache_file()?);
    }
    if let Some(scan) = config.prepuller.scan.as_mut() {
        if scan.cache_file.is_none() {
            scan.cache_file = config.scan.cache_file.clone();
        }
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    match Opt::parse() {
        Opt::Scan {
            config,
            json,
            debug,
        } => {
            init_logger(debug);
            let config = load_config(config)?;
            let mut repo = ScanRepo::new(config.scan, UreqClient::new());
            let result = repo.scan()?;
            if json {
                println!("{}", result.to_json()?);
            } else {
                print!("{}", result.env_report());
            }
        }

        Opt::Prepull {
            config,
            no_scan,
            debug,
        } => {
            init_logger(debug);
            let mut config = load_config(config)?;
            if config.prepuller.scan.is_none() && !no_scan {
                config.prepuller.scan = Some(config.scan.clone());
            }
            let cluster = Arc::new(KubeCluster::new()?);
            let mut prepuller = Prepuller::new(cluster, config.prepuller)?;
            if !no_scan {
                prepuller.update_images_from_repo(UreqClient::new())?;
            }
            if prepuller.images().is_empty() {
                anyhow::bail!("No images to prepull");
            }
            prepuller.build_nodelist()?;
            prepuller.build_pod_specs();
            let report = prepuller.run_pods()?;
            prepuller.clean_completed_pods()?;

            for node in &report.nodes {
                let pulled = node
                    .jobs
                    .iter()
                    .filter(|(_, state)| *state == labpuller::prepull::JobState::Deleted)
                    .count();
                match &node.error {
                    Some(e) => println!("{}: {}/{} pulled, {}", node.node, pulled, node.jobs.len(), e),
                    None => println!("{}: {}/{} pulled", node.node, pulled, node.jobs.len()),
                }
            }
            report.ensure_success()?;
        }
    }
    Ok(())
}
