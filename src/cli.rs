use clap::{Parser, Subcommand};

const DEFAULT_DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data");

#[derive(Parser, Debug)]
#[command(name = "cnes-locator")]
#[command(about = "Healthcare establishment proximity API (DuckDB + Photon)", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API (requires a loaded CNES database).
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Data directory holding the CNES DuckDB database.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: String,

    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 8787)]
    pub port: u16,

    /// Base URL of the Photon geocoding service.
    #[arg(long, default_value = "https://photon.komoot.io")]
    pub photon_url: String,

    /// Geocoder request timeout in seconds; a timed-out lookup degrades to
    /// "no candidates", it never stalls the request.
    #[arg(long, default_value_t = 8)]
    pub geocode_timeout_secs: u64,
}
