use clap::{crate_version, Arg, ArgAction, Command};

/// Options shared by every command that filters a vmcore.
fn filter_args(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("vmcore")
            .help("ELF image of the crashed kernel, e.g. /proc/vmcore")
            .required(true)
            .action(ArgAction::Set),
    )
    .arg(
        Arg::new("config")
            .long("config")
            .value_name("FILE")
            .help("TOML file with default dump options")
            .action(ArgAction::Set),
    )
    .arg(
        Arg::new("non-cyclic")
            .long("non-cyclic")
            .help("keep whole-machine bitmaps in a scratch file")
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("cyclic-buffer")
            .long("cyclic-buffer")
            .value_name("KB")
            .help("size of the bitmap buffer of one window in kilobytes")
            .value_parser(clap::value_parser!(u64))
            .conflicts_with("non-cyclic")
            .action(ArgAction::Set),
    )
    .arg(
        Arg::new("tmpdir")
            .long("tmpdir")
            .value_name("DIR")
            .help("directory of the scratch bitmap file")
            .action(ArgAction::Set),
    )
}

/// Options selecting what a dump file contains.
fn dump_args(cmd: Command) -> Command {
    filter_args(cmd)
        .arg(
            Arg::new("dump-level")
                .short('d')
                .long("dump-level")
                .value_name("LEVELS")
                .help("dump levels to try in order, e.g. 31,11,1")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("zlib")
                .short('c')
                .help("compress pages with zlib")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("lzo")
                .short('l')
                .help("compress pages with lzo")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("snappy")
                .short('p')
                .help("compress pages with snappy")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("elf")
                .short('E')
                .help("write an ELF core instead of a compressed dump")
                .conflicts_with_all(["zlib", "lzo", "snappy"])
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("erase")
                .long("erase")
                .value_name("SYMBOL:SIZE|SYMBOL:nullify")
                .help("clear the memory of a kernel symbol in the dump")
                .action(ArgAction::Append),
        )
}

pub fn command() -> Command {
    Command::new("kdumpflow")
        .version(crate_version!())
        .about("filters the memory of a crashed linux kernel into a small dump file")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count),
        )
        .subcommand(
            dump_args(Command::new("create").about("write a dump file"))
                .arg(
                    Arg::new("flatten")
                        .short('F')
                        .help("write the flattened format to standard output")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("dumpfile")
                        .help("output file")
                        .required_unless_present("flatten")
                        .conflicts_with("flatten")
                        .action(ArgAction::Set),
                ),
        )
        .subcommand(
            dump_args(Command::new("split").about("write a dump split into several files"))
                .arg(
                    Arg::new("dumpfiles")
                        .help("output files, one per worker")
                        .required(true)
                        .num_args(2..)
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("rearrange")
                .about("rebuild a dump file from a flattened stream on standard input")
                .arg(Arg::new("dumpfile").required(true).action(ArgAction::Set)),
        )
        .subcommand(
            Command::new("reassemble")
                .about("merge split dump files into one")
                .arg(Arg::new("dumpfile").required(true).action(ArgAction::Set))
                .arg(
                    Arg::new("splitfiles")
                        .required(true)
                        .num_args(2..)
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(filter_args(
            Command::new("mem-usage").about("print how many pages every category would exclude"),
        ))
}
