use std::env;

use anders::middle_end::anders::config::AndersConfig;
use anders::middle_end::anders::fromstr_impl::solve_cons_file;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: constraints <file.cons> [--stats]");
        std::process::exit(1);
    }
    let input = read_from(&args[1]);
    let anders = solve_cons_file(&input, AndersConfig::default())
        .unwrap_or_else(|e| panic!("{e}"));
    print!("{}", anders.raw_graph_to_string());
    if args.iter().any(|a| a == "--stats") {
        eprint!("{}", anders.stats);
    }
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {}", path)),
    )
    .expect("The input file does not contain valid utf-8 text")
}
