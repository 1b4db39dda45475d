use std::env;

use anders::middle_end::anders::config::AndersConfig;
use anders::middle_end::anders::Anders;
use anders::middle_end::lir::Program;

fn usage() -> ! {
    eprintln!(
        "usage: anders <file.lir> [--sorted] [--constraints] [--structs] [--stats] \
         [--ext-unknown] [--oci-only] [--no-solve] [--field-insensitive] [--config <file.json>]"
    );
    std::process::exit(1)
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage();
    }
    let lir_file_name = &args[1];

    let mut config = AndersConfig::default();
    let mut sorted = false;
    let mut dump_constraints = false;
    let mut dump_structs = false;
    let mut dump_stats = false;
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--sorted" => sorted = true,
            "--constraints" => dump_constraints = true,
            "--structs" => dump_structs = true,
            "--stats" => dump_stats = true,
            "--ext-unknown" => config.list_ext_unknown = true,
            "--oci-only" => config.oci_only = true,
            "--no-solve" => config.no_solve = true,
            "--field-insensitive" => config.field_sensitive = false,
            "--config" => {
                i += 1;
                let path = args.get(i).cloned().unwrap_or_else(|| usage());
                let text = read_from(&path);
                config = serde_json::from_str(&text)
                    .unwrap_or_else(|e| panic!("bad config file {path}: {e}"));
            }
            _ => usage(),
        }
        i += 1;
    }

    let input = read_from(lir_file_name);
    let prog = input
        .parse::<Program>()
        .unwrap_or_else(|e| panic!("{e}"))
        .validate()
        .unwrap_or_else(|e| panic!("validation error: {e}"));

    let mut anders = Anders::new(config.clone());
    // drive the stages by hand so the dumps can happen at the right
    // moments; `run` would clean up before we get to print anything.
    anders.run_init();
    if let Err(e) = anders.obj_cons_id(&prog) {
        panic!("{e}");
    }
    if dump_structs {
        print!("{}", anders.struct_info_to_string());
    }
    if config.list_ext_unknown {
        for name in anders.unknown_externals() {
            eprintln!("unknown external function: {name}");
        }
    }
    anders.pre_opt_cleanup();
    if !config.oci_only {
        anders.cons_opt();
        if !config.no_solve {
            anders.pts_init();
            anders.solve_init();
            anders.solve();
        }
    }
    if dump_constraints {
        print!("{}", anders.constraints_to_string(sorted));
    }
    if !config.oci_only && !config.no_solve {
        print!("{}", anders.cons_graph_to_string(sorted));
        if anders.is_partial() {
            eprintln!("warning: resource limit hit, the result is partial");
        }
    }
    if dump_stats {
        eprint!("{}", anders.stats);
        eprintln!("{}", anders.cache_report());
    }
    anders.run_cleanup();
    anders.pts_cleanup();
}

fn read_from(path: &str) -> String {
    String::from_utf8(
        std::fs::read(path).unwrap_or_else(|_| panic!("Could not read the input file {}", path)),
    )
    .expect("The input file does not contain valid utf-8 text")
}
