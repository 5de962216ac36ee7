//! One-shot controller commands
//!
//! Sends a single command to the line follower over CoAP and prints the reply.
//!
//! Usage:
//!   cargo run --bin follower-ctl -- stop
//!   cargo run --bin follower-ctl -- --device 127.0.0.1:5683 speed 120 100
//!   cargo run --bin follower-ctl -- --config config/dev.toml status

use clap::{Parser, Subcommand};
use follower_gateway::domain::Command;
use follower_gateway::infra::Config;
use follower_gateway::io::CoapDeviceClient;
use follower_gateway::services::DeviceClient;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "follower-ctl")]
#[command(about = "Send one command to the line follower controller")]
struct Args {
    /// Controller address (host:port)
    #[arg(short, long, env = "FOLLOWER_DEVICE", default_value = "192.168.190.40:5683")]
    device: String,

    /// Take the device address and timeout from a gateway config file instead
    #[arg(short, long)]
    config: Option<String>,

    /// Response timeout (ms)
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Start the motors
    Start,
    /// Stop the motors
    Stop,
    /// Toggle the line sensor logic
    Invert,
    /// Set wheel speeds (0-255)
    Speed { left: u8, right: u8 },
    /// Read the controller status
    Status,
}

impl Action {
    fn command(&self) -> Option<Command> {
        match self {
            Action::Start => Some(Command::Start),
            Action::Stop => Some(Command::Stop),
            Action::Invert => Some(Command::InvertLogic),
            Action::Speed { left, right } => Some(Command::SetSpeed { left: *left, right: *right }),
            Action::Status => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let (addr, timeout) = match args.config {
        Some(ref path) => {
            let config = Config::from_file(path)?;
            (config.device_addr(), config.command_timeout())
        }
        None => (args.device.clone(), Duration::from_millis(args.timeout_ms)),
    };
    let client = CoapDeviceClient::new(addr);

    let start = Instant::now();
    let response = match args.action.command() {
        Some(command) => {
            println!(
                "PUT coap://{}/{} payload={:?}",
                client.addr(),
                command.path(),
                String::from_utf8_lossy(&command.payload())
            );
            client.put(command.path(), &command.payload(), timeout).await
        }
        None => {
            println!("GET coap://{}/status", client.addr());
            client.get("status", timeout).await
        }
    };
    let elapsed_ms = start.elapsed().as_millis();

    match response {
        Ok(body) => {
            let text = String::from_utf8_lossy(&body);
            // Pretty-print JSON bodies (status), otherwise print as-is
            match serde_json::from_slice::<serde_json::Value>(&body) {
                Ok(json) if json.is_object() => {
                    println!("{}", serde_json::to_string_pretty(&json)?)
                }
                _ => println!("{}", text),
            }
            println!("({}ms)", elapsed_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} failed after {}ms: {}", args.action_name(), elapsed_ms, e);
            std::process::exit(1);
        }
    }
}

impl Args {
    fn action_name(&self) -> &'static str {
        match self.action {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Invert => "invert",
            Action::Speed { .. } => "speed",
            Action::Status => "status",
        }
    }
}
