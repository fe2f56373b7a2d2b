use clap::Parser;
use vsearch::Opts;
use vsearch::cli::SubCommandExtend;
use vsearch::config::SubCommand;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Score(config) => config.run(&opts),
        SubCommand::Search(config) => config.run(&opts),
        SubCommand::Scan(config) => config.run(&opts),
    }
}
