/*!
`kdumpflow` writes the memory of a crashed linux kernel into a dump file,
leaving out the pages an analysis does not need.
*/

use std::fs::File;
use std::io;
use std::process;

use clap::ArgMatches;
use log::{info, Level};

use kdumpflow_core::*;

mod cli;
mod config;

fn init_logger(matches: &ArgMatches) {
    let verbose = matches
        .subcommand()
        .map(|(_, m)| m.get_count("verbose"))
        .unwrap_or(0)
        .max(matches.get_count("verbose"));
    let level = match verbose {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    };
    // standard output may carry a flattened dump
    if let Err(e) = simplelog::TermLogger::init(
        level.to_level_filter(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    ) {
        eprintln!("unable to initialize logging: {}", e);
    }
}

fn open_dump_file(path: &str) -> Result<KdumpReader<File>> {
    let file = File::open(path).map_err(|e| {
        Error::from_io(ErrorOrigin::Reassemble, ErrorKind::UnableToOpenFile, &e).log_error(format!("{}: {}", path, e))
    })?;
    KdumpReader::new(file)
}

fn create(matches: &ArgMatches) -> Result<()> {
    let flatten = matches.get_flag("flatten");
    let config = config::dump_config(matches)?.with_flatten(flatten);
    let (mut vmcore, kernel) = kdumpflow_vmcore::open(required(matches, "vmcore")?)?;
    let dumper = Dumper::new(&kernel, &config)?;

    if flatten {
        let mut target = StreamTarget::new(io::stdout().lock());
        let report = dumper.create(&mut vmcore, &mut target)?;
        eprintln!("{}", report);
    } else {
        let mut target = FileTarget::new(required(matches, "dumpfile")?);
        let report = dumper.create(&mut vmcore, &mut target)?;
        println!("{}", report);
    }
    Ok(())
}

fn split(matches: &ArgMatches) -> Result<()> {
    let files = matches
        .get_many::<String>("dumpfiles")
        .map(|files| files.map(Into::into).collect::<Vec<_>>())
        .unwrap_or_default();
    let config = config::dump_config(matches)?.with_split(files);
    let (mut vmcore, kernel) = kdumpflow_vmcore::open(required(matches, "vmcore")?)?;

    let mut targets = config.split.iter().map(FileTarget::new).collect::<Vec<_>>();
    let report = Dumper::new(&kernel, &config)?.create_split(&mut vmcore, &mut targets)?;
    println!("{}", report);
    Ok(())
}

fn rearrange_stdin(matches: &ArgMatches) -> Result<()> {
    let input = StallReader::new(io::stdin(), STALL_TIMEOUT)?;
    let mut sink = FileSink::create(required(matches, "dumpfile")?)?;
    let records = rearrange(input, &mut sink)?;
    sink.finish()?;
    info!("{} records rearranged", records);
    Ok(())
}

fn reassemble_files(matches: &ArgMatches) -> Result<()> {
    let files = matches
        .get_many::<String>("splitfiles")
        .into_iter()
        .flatten()
        .map(|path| open_dump_file(path))
        .collect::<Result<Vec<_>>>()?;
    let mut sink = FileSink::create(required(matches, "dumpfile")?)?;
    let pages = reassemble(files, &mut sink)?;
    sink.finish()?;
    info!("{} pages reassembled", pages);
    Ok(())
}

fn mem_usage(matches: &ArgMatches) -> Result<()> {
    let config = config::filter_config(matches)?;
    let (mut vmcore, kernel) = kdumpflow_vmcore::open(required(matches, "vmcore")?)?;
    let report = Dumper::new(&kernel, &config)?.mem_usage(&mut vmcore)?;
    print!("{}", report.mem_usage());
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| Error(ErrorOrigin::Args, ErrorKind::ArgValidation).log_error(format!("missing {}", id)))
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("create", m)) => create(m),
        Some(("split", m)) => split(m),
        Some(("rearrange", m)) => rearrange_stdin(m),
        Some(("reassemble", m)) => reassemble_files(m),
        Some(("mem-usage", m)) => mem_usage(m),
        _ => Err(Error(ErrorOrigin::Args, ErrorKind::ArgValidation).log_error("unknown command")),
    }
}

fn main() {
    let matches = cli::command().get_matches();
    init_logger(&matches);

    let code = match run(&matches) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("kdumpflow: {}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}
