use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "gora-cluster")]
#[command(about = "Runs the gora cluster manager and the media agents of its config file")]
#[command(version)]
pub(crate) struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    pub(crate) config_file: String,

    /// Broker url, overrides `mq.broker.url`
    #[arg(long)]
    pub(crate) broker_url: Option<String>,

    /// Prometheus exporter http address, overrides the config file
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,

    /// Allocate one worker of each kind once the agents reported, and log the outcome
    #[arg(long)]
    pub(crate) smoke_test: bool,
}
