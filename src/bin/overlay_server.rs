use tokio::io::{AsyncBufReadExt, BufReader};

use overlay_net::{Server, ServerConfig};

#[tokio::main]
async fn main() {
    overlay_net::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match ServerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let server = match Server::start(config, None).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "server failed to start");
            std::process::exit(1);
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !server.treat_console_input(&line) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "console read error");
                break;
            }
        }
    }

    server.shutdown();
}
