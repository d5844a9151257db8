use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod client;

use client::{FleetReply, GatewayClient};

#[derive(Parser, Debug)]
#[command(name = "fleetctl", about = "Drive a rover fleet through the gateway")]
struct Cli {
    #[arg(long, env = "FLEETCTL_GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    gateway_url: String,
    /// Session returned by `fleetctl start`.
    #[arg(long, env = "FLEET_SESSION_ID", default_value = "")]
    session: String,
    /// Budget for fleet-wide reads, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Start,
    Status {
        /// Ask each rover instead of the fleet endpoint.
        #[arg(long)]
        per_rover: bool,
        /// Print what the gateway already knows without asking the backend.
        #[arg(long, conflicts_with = "per_rover")]
        cached: bool,
    },
    Battery,
    Coordinates,
    Sensors,
    /// Cross-check each rover's sensors against the rest of the fleet.
    SensorHealth,
    /// Assign a task to the nearest free rovers.
    Coordinate {
        task: String,
        #[arg(allow_negative_numbers = true)]
        x: i64,
        #[arg(allow_negative_numbers = true)]
        y: i64,
        /// Rovers to send; defaults to the task's crew size.
        #[arg(long)]
        crew: Option<usize>,
    },
    Move {
        rover: String,
        direction: String,
    },
    Reset {
        rover: String,
    },
    Task {
        rover: String,
        task: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let client = GatewayClient::new(&cli.gateway_url)?;
    let session = cli.session.as_str();

    match cli.command {
        Command::Start => {
            let session_id = client.start_session().await?;
            println!("{session_id}");
        }
        Command::Status { per_rover, cached } => {
            let path = if cached {
                "api/fleet/cached"
            } else if per_rover {
                "api/rover/status"
            } else {
                "api/fleet/status"
            };
            print_reply(client.fleet_view(path, session, cli.timeout_ms).await?)?;
        }
        Command::Battery => {
            print_reply(client.fleet_view("api/rover/battery", session, cli.timeout_ms).await?)?;
        }
        Command::Coordinates => {
            print_reply(
                client
                    .fleet_view("api/rover/coordinates", session, cli.timeout_ms)
                    .await?,
            )?;
        }
        Command::Sensors => {
            print_reply(
                client
                    .fleet_view("api/rover/sensor-data", session, cli.timeout_ms)
                    .await?,
            )?;
        }
        Command::SensorHealth => {
            print_reply(
                client
                    .fleet_view("api/rover/sensor-health", session, cli.timeout_ms)
                    .await?,
            )?;
        }
        Command::Coordinate { task, x, y, crew } => {
            print_reply(
                client
                    .coordinate(session, &task, [x, y], crew, cli.timeout_ms)
                    .await?,
            )?;
        }
        Command::Move { rover, direction } => {
            let ack = client.move_rover(session, &rover, &direction).await?;
            println!("{}", ack.message);
        }
        Command::Reset { rover } => {
            let ack = client.reset_rover(session, &rover).await?;
            println!("{}", ack.message);
        }
        Command::Task { rover, task } => {
            let ack = client.assign_task(session, &rover, &task).await?;
            println!("{}", ack.message);
        }
    }

    Ok(())
}

fn print_reply(reply: FleetReply) -> Result<()> {
    if reply.partial {
        warn!("some rovers did not answer; see the errors entry");
    }
    println!("{}", serde_json::to_string_pretty(&reply.body)?);
    Ok(())
}
