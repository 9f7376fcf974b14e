use structopt::StructOpt;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get the command line arguments.
    let opts = scmp::cli::Opts::from_args();

    // Initialize logging.
    {
        let mut env_var_exists = false;
        // If environment var is empty or does not exist, derive the level
        // from --verbosity.
        if std::env::var("RUST_LOG")
            .map(|x| x.is_empty())
            .unwrap_or(true)
        {
            std::env::set_var("RUST_LOG", scmp::cli::log_filter(opts.verbosity));
        } else {
            env_var_exists = true;
        }
        tracing_subscriber::fmt::init();
        if env_var_exists {
            info!("Picked up $RUST_LOG");
        }
    }

    scmp::run(opts).await
}
