mod cli;
mod client;
mod models;
mod render;
mod repl;

use client::StoreClient;
use repl::REPL;

fn main() {
    let config = match cli::parse_config() {
        Ok(config) => config,
        Err(err) => {
            render::error(&err);
            std::process::exit(2);
        }
    };
    let client = StoreClient::new(&config);
    let mut repl = REPL::new(config, client);
    repl.run();
}
