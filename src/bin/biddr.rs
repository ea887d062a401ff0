use std::time::Duration;

use biddr::protocol::{Direction, Price, RegisterUser, SearchOptions, SortBy};
use biddr::{setup_local_tracing, AppResult, Client, ClientConfig, PROTOCOL_VERSION};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::runtime;

#[derive(Parser)]
#[command(version, about = "Command line client for a biddrd server")]
pub struct CommandLine {
    /// server address
    #[arg(short, long, default_value = "127.0.0.1:4730")]
    pub address: String,
    /// handshake and request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
    /// silence after which the server is considered gone, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub ping_timeout_ms: u64,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// connect, complete the handshake and disconnect
    Ping,
    /// log in with a username and password
    Login { username: String, password: String },
    /// create an account
    Register {
        username: String,
        first_name: String,
        last_name: String,
        password: String,
    },
    /// list running auctions matching TEXT
    Search {
        #[arg(default_value = "")]
        text: String,
        /// only auctions without bids
        #[arg(long)]
        no_bids: bool,
    },
}

fn main() -> AppResult<()> {
    let commandline = CommandLine::parse();
    setup_local_tracing()?;

    let config = ClientConfig {
        address: commandline.address.clone(),
        protocol_version: PROTOCOL_VERSION,
        timeout: Duration::from_millis(commandline.timeout_ms),
        ping_timeout: Duration::from_millis(commandline.ping_timeout_ms),
        ..ClientConfig::default()
    };

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(run(config, commandline.command))
}

async fn run(config: ClientConfig, command: Command) -> AppResult<()> {
    let client = Client::connect(config).await?;

    match command {
        Command::Ping => println!("connected to {}", client.connection().peer()),
        Command::Login { username, password } => {
            let user = client.login(&username, &password).await?;
            println!(
                "logged in as {} {} ({})",
                user.first_name, user.last_name, user.user_id
            );
        }
        Command::Register {
            username,
            first_name,
            last_name,
            password,
        } => {
            let user = client
                .register(RegisterUser {
                    username,
                    first_name,
                    last_name,
                    password_confirm: password.clone(),
                    password,
                })
                .await?;
            println!("registered {} ({})", user.username, user.user_id);
        }
        Command::Search { text, no_bids } => {
            let now = Utc::now();
            let items = client
                .search(SearchOptions {
                    text,
                    start_time: now - chrono::Duration::days(365),
                    end_time: now + chrono::Duration::days(365),
                    min_reserve: Price::ZERO,
                    no_bids,
                    sort: SortBy::Time,
                    direction: Direction::Ascending,
                })
                .await?;
            for item in &items {
                let top = item
                    .top_bid()
                    .map(|bid| bid.price)
                    .unwrap_or(Price::ZERO);
                println!(
                    "{}  {:<30} reserve {:>10} top {:>10} ends {}",
                    item.item_id,
                    item.title,
                    item.reserve.to_string(),
                    top.to_string(),
                    item.end_time
                );
            }
            println!("{} result(s)", items.len());
        }
    }

    client.shutdown();
    Ok(())
}
