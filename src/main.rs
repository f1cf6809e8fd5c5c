use clap::Parser;
use readclip::{
    args::{build_invocation, Cli, ReportArg},
    runner, stats,
};

fn main() {
    let args = Cli::parse();
    init_logging(&args);

    let invocation = match build_invocation(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("readclip: error: {e}");
            std::process::exit(2);
        }
    };

    log::info!(
        "processing reads on {} core{} in {} mode",
        invocation.run_config.cores,
        if invocation.run_config.cores > 1 { "s" } else { "" },
        if invocation.pipeline.paired { "paired-end" } else { "single-end" }
    );

    let stats = match runner::run(
        &invocation.pipeline,
        &invocation.inputs,
        &invocation.layout,
        &invocation.run_config,
    ) {
        Ok(stats) => stats,
        Err(e) => {
            let code = match e.kind() {
                std::io::ErrorKind::Interrupted => {
                    eprintln!("Interrupted");
                    130
                }
                _ => {
                    if args.debug > 0 {
                        eprintln!("{e:?}");
                    }
                    eprintln!("readclip: error: {e}");
                    1
                }
            };
            std::process::exit(code);
        }
    };

    if !args.quiet {
        let mut stderr = std::io::stderr().lock();
        let result = match args.report {
            Some(ReportArg::Minimal) => stats::write_minimal_report(&stats, invocation.pipeline.paired, &mut stderr),
            _ => stats::write_report(
                &stats,
                [
                    invocation.pipeline.adapters1.as_slice(),
                    invocation.pipeline.adapters2.as_slice(),
                ],
                invocation.pipeline.paired,
                &mut stderr,
            ),
        };
        if let Err(e) = result {
            eprintln!("readclip: error: {e}");
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &Cli) {
    let level = if args.quiet {
        log::LevelFilter::Error
    } else if args.debug > 0 {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}
