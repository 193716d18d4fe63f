use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 8004)]
    pub port: u16,
    /// Maximum number of jobs executing at once.
    #[arg(short = 'j', long, default_value_t = 4)]
    pub max_concurrency: usize,
    /// Directory for cached job results.
    #[arg(long, default_value = "./cache")]
    pub cache_dir: PathBuf,
    /// Directory for rendered artifacts.
    #[arg(long, default_value = "./outputs")]
    pub output_dir: PathBuf,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
}
