//! Example echo client.
//!
//! Connects to an echod server, sends a message a number of times, and
//! checks each echo coming back.

use clap::Parser;
use echod::runtime::Socket;
use std::process::ExitCode;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version)]
#[command(about = "Echo client for echod", long_about = None)]
struct Args {
    /// Server address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    address: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Message to send
    #[arg(short = 'm', long, default_value = "hello")]
    message: String,

    /// Number of round trips
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let socket = match connect(&args) {
        Ok(socket) => socket,
        Err(e) => {
            eprintln!("Failed to connect to {}:{}: {e}", args.address, args.port);
            return ExitCode::FAILURE;
        }
    };
    println!("Connected to {}", socket.peer_addr_string());

    let payload = args.message.as_bytes();
    let started = Instant::now();

    for i in 0..args.count {
        if let Err(e) = send_all(&socket, payload) {
            eprintln!("Send failed on round trip {i}: {e}");
            return ExitCode::FAILURE;
        }
        match receive_exact(&socket, payload.len()) {
            Ok(echo) if echo == payload => {}
            Ok(echo) => {
                eprintln!(
                    "Echo mismatch on round trip {i}: sent {:?}, received {:?}",
                    args.message,
                    String::from_utf8_lossy(&echo)
                );
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("Receive failed on round trip {i}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let elapsed = started.elapsed();
    println!(
        "{} round trips of {} bytes in {:.3?}",
        args.count,
        payload.len(),
        elapsed
    );
    ExitCode::SUCCESS
}

fn connect(args: &Args) -> std::io::Result<Socket> {
    let socket = Socket::new()?;
    socket.connect(&args.address, args.port)?;
    socket.set_nodelay(true)?;
    Ok(socket)
}

fn send_all(socket: &Socket, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = socket.send(data)?;
        data = &data[n..];
    }
    Ok(())
}

fn receive_exact(socket: &Socket, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = socket.receive(&mut buf[filled..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection mid-echo",
            ));
        }
        filled += n;
    }
    Ok(buf)
}
