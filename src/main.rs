use clap::Parser;

use dj_tools::cli::{Cli, Commands};
use dj_tools::commands::{self, DownloadArgs};
use dj_tools::config::Settings;
use dj_tools::util;

fn main() {
    let cli = Cli::parse();
    // keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = util::init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        tracing::error!("{:#}", e);
        util::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Commands::Check { peer } => commands::handle_check(&settings, &peer),
        Commands::Search { peer, query, search_ms, any_bitrate } => {
            commands::handle_search(&settings, &peer, &query, search_ms, any_bitrate)
        }
        Commands::Download {
            peer,
            queries,
            items,
            concurrency,
            max_time,
            expire_retries,
            fail_retries,
            out,
            burn,
            open,
            discard,
            json,
            quiet,
        } => {
            let args = DownloadArgs {
                queries,
                items,
                concurrency,
                max_time,
                expire_retries,
                fail_retries,
                out,
                burn,
                open,
                discard,
                json,
                quiet,
            };
            commands::handle_download(&settings, &peer, &args)
        }
    }
}
