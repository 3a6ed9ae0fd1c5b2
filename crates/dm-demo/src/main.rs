#![forbid(unsafe_code)]

//! dm-demo binary entry point.

use std::process;

use dm_demo::{app, cli};

fn main() {
    let opts = cli::Opts::parse();

    if let Err(e) = dm_runtime::logging::init(&opts.log_config()) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    match app::run(&opts) {
        Ok(summary) => {
            // Journal lines already own stdout; keep the summary off it.
            let to_stdout = !opts.journal_on_stdout();
            for point in &summary.points {
                if to_stdout {
                    println!("{point}");
                } else {
                    eprintln!("{point}");
                }
            }
            if !summary.settled {
                eprintln!("Subscribers did not settle before shutdown");
                process::exit(2);
            }
        }
        Err(e) => {
            eprintln!("Runtime error: {e}");
            process::exit(1);
        }
    }
}
