use clap::{App, Arg};
use dataflow::Runtime;
use dataflow_bench::{run_all, Options};

fn main() {
    let matches = App::new("Dataflow Pipeline")
        .about("Runs the demo pipelines on software devices")
        .arg(
            Arg::with_name("elements")
                .short("n")
                .help("Elements per buffer")
                .default_value("65536")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("iterations")
                .short("i")
                .help("Jacobi iterations")
                .default_value("16")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("queues")
                .short("q")
                .help("Queues, spread round robin over the devices")
                .default_value("2")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("devices")
                .short("d")
                .help("Number of software devices")
                .default_value("2")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("compute_units")
                .short("c")
                .help("Worker threads per kernel launch")
                .default_value("4")
                .takes_value(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();
    let parse = |name: &str| -> usize {
        let value = matches.value_of(name).unwrap();
        value.parse().unwrap_or_else(|_| {
            eprintln!("{} expects a number, got {}", name, value);
            std::process::exit(2)
        })
    };
    let options = Options {
        elements: parse("elements"),
        iterations: parse("iterations"),
        queues: parse("queues"),
    };
    let runtime = Runtime::builder()
        .device_count(parse("devices"))
        .compute_units(parse("compute_units"))
        .build()
        .unwrap_or_else(|e| {
            eprintln!("runtime: {}", e);
            std::process::exit(1)
        });
    match run_all(&runtime, options) {
        Ok(reports) => {
            for report in reports {
                println!(
                    "{:<8} {:>4} submissions {:>12?} checksum {}",
                    report.name, report.submissions, report.elapsed, report.checksum
                );
            }
        }
        Err(e) => {
            eprintln!("pipeline failed: {}", e);
            std::process::exit(1)
        }
    }
}
