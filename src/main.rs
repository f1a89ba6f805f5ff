use pgvpd::app;
use pgvpd::config::{store_config, Config};

fn main() {
    let args = app::parse();

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Config error: {err}");
            std::process::exit(1);
        }
    };

    if args.test_config {
        println!("Configuration OK: {}", args.config_file);
        return;
    }

    store_config(config.clone());
    app::init_logging(&args);

    if let Err(err) = app::run_server(&args, config) {
        log::error!("fatal: {err}");
        std::process::exit(1);
    }
}
