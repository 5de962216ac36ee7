//! Mock line follower controller (CoAP over UDP)
//!
//! Simulates the robot's embedded controller for local testing.
//!
//! Resources:
//! - PUT `start`, `stop` (payload `1`) - motor on/off
//! - PUT `inverterLogica` (payload `1`) - toggle line sensor logic
//! - PUT `setVelocidade` (payload `L,R`, 0-255 each) - wheel speeds
//! - GET `status` - JSON state
//!
//! Behaviour switches:
//! - `--delay-ms` holds every response back (exercise command timeouts)
//! - `--silent` never answers
//! - `--separate` answers with an empty ACK first, then a separate response
//!
//! Usage:
//!   cargo run --bin mock-device -- --port 5683 --delay-ms 6000

use clap::Parser;
use follower_gateway::io::coap::{
    code_string, Message, MessageType, CODE_BAD_REQUEST, CODE_CHANGED, CODE_CONTENT, CODE_GET,
    CODE_NOT_FOUND, CODE_PUT, MAX_MESSAGE_SIZE,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Parser, Debug)]
#[command(name = "mock-device")]
#[command(about = "Mock line follower controller for local simulation")]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value = "5683")]
    port: u16,

    /// Delay before every response (ms)
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Never respond
    #[arg(long)]
    silent: bool,

    /// Acknowledge first, respond separately
    #[arg(long)]
    separate: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DeviceState {
    running: bool,
    inverted: bool,
    left: u8,
    right: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self { running: false, inverted: false, left: 100, right: 100 }
    }
}

/// Apply one request to the simulated device; returns (code, payload)
fn apply(state: &mut DeviceState, code: u8, path: &str, payload: &[u8]) -> (u8, Vec<u8>) {
    match (code, path) {
        (CODE_PUT, "start") => {
            state.running = true;
            (CODE_CHANGED, b"Iniciado".to_vec())
        }
        (CODE_PUT, "stop") => {
            state.running = false;
            (CODE_CHANGED, b"Parado".to_vec())
        }
        (CODE_PUT, "inverterLogica") => {
            state.inverted = !state.inverted;
            let reply = if state.inverted { "Logica invertida" } else { "Logica normal" };
            (CODE_CHANGED, reply.as_bytes().to_vec())
        }
        (CODE_PUT, "setVelocidade") => match parse_speeds(payload) {
            Some((left, right)) => {
                state.left = left;
                state.right = right;
                (CODE_CHANGED, format!("Velocidade {left},{right}").into_bytes())
            }
            None => (CODE_BAD_REQUEST, b"expected L,R".to_vec()),
        },
        (CODE_GET, "status") => match serde_json::to_vec(state) {
            Ok(json) => (CODE_CONTENT, json),
            Err(_) => (CODE_BAD_REQUEST, Vec::new()),
        },
        _ => (CODE_NOT_FOUND, Vec::new()),
    }
}

fn parse_speeds(payload: &[u8]) -> Option<(u8, u8)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (left, right) = text.split_once(',')?;
    Some((left.trim().parse().ok()?, right.trim().parse().ok()?))
}

async fn send(socket: &UdpSocket, msg: &Message, peer: SocketAddr) {
    match msg.encode() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                eprintln!("[MOCK] Send to {} failed: {}", peer, e);
            }
        }
        Err(e) => eprintln!("[MOCK] Encode failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let socket = UdpSocket::bind(("0.0.0.0", args.port)).await?;

    println!("[MOCK] Line follower controller listening on udp/{}", args.port);
    if args.silent {
        println!("[MOCK] Silent mode: requests will not be answered");
    } else if args.delay_ms > 0 {
        println!("[MOCK] Responses delayed by {}ms", args.delay_ms);
    }

    let mut state = DeviceState::default();
    let mut buf = [0u8; MAX_MESSAGE_SIZE];
    // Last (peer, message id, reply) for answering retransmissions
    let mut last: Option<(SocketAddr, u16, Message)> = None;
    let mut next_message_id: u16 = 0x4000;

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let request = match Message::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                eprintln!("[MOCK] Invalid message from {}: {} ({})", peer, e, hex::encode(&buf[..len]));
                continue;
            }
        };

        if request.mtype == MessageType::Acknowledgement || request.mtype == MessageType::Reset {
            continue;
        }

        if let Some((last_peer, last_mid, ref reply)) = last {
            if last_peer == peer && last_mid == request.message_id {
                println!("[MOCK] Duplicate mid={} from {}, resending reply", last_mid, peer);
                send(&socket, reply, peer).await;
                continue;
            }
        }

        let path = request.uri_path();
        println!(
            "[MOCK] {} /{} payload={:?} mid={} from {}",
            code_string(request.code),
            path,
            String::from_utf8_lossy(&request.payload),
            request.message_id,
            peer
        );

        if args.silent {
            continue;
        }

        let (code, payload) = apply(&mut state, request.code, &path, &request.payload);
        println!(
            "[MOCK] -> {} {} (running={}, inverted={}, speed={},{})",
            code_string(code),
            String::from_utf8_lossy(&payload),
            state.running,
            state.inverted,
            state.left,
            state.right
        );

        let confirmable = request.mtype == MessageType::Confirmable;
        if args.separate && confirmable {
            send(&socket, &Message::empty(MessageType::Acknowledgement, request.message_id), peer)
                .await;
        }

        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }

        let reply = if confirmable && !args.separate {
            Message::ack_response(&request, code, &payload)
        } else {
            next_message_id = next_message_id.wrapping_add(1);
            let mut separate = Message::ack_response(&request, code, &payload);
            separate.mtype =
                if confirmable { MessageType::Confirmable } else { MessageType::NonConfirmable };
            separate.message_id = next_message_id;
            separate
        };
        send(&socket, &reply, peer).await;
        last = Some((peer, request.message_id, reply));
    }
}
