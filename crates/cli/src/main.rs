fn main() {
    artcache_cli::init_logging();

    if let Err(error) = artcache_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
