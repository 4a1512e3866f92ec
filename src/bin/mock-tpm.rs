// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Serves the mock TPM over the Microsoft TPM 2.0 simulator protocol.

use clap::Parser;
use cli::{
    mocktpm::MockTpm,
    transport::{TPM_SEND_COMMAND, TPM_SESSION_END},
    util::parse_handle,
};
use log::{error, info, warn};
use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    thread,
};

const BIND_ATTEMPTS: usize = 32;

/// Mock TPM speaking the TPM 2.0 simulator protocol
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Command port; the platform port is the next one. Zero picks a free pair.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// NV index to define, as `<handle>=<hex data>`
    #[arg(long, value_name = "HANDLE=HEX")]
    nv: Vec<String>,
}

fn parse_nv(arg: &str) -> Result<(u32, Vec<u8>), String> {
    let (handle, data) = arg
        .split_once('=')
        .ok_or_else(|| format!("'{arg}': expected <handle>=<hex data>"))?;
    let handle = parse_handle(handle).map_err(|e| e.to_string())?;
    let data = hex::decode(data).map_err(|e| format!("'{arg}': {e}"))?;
    Ok((handle, data))
}

fn bind_pair(port: u16) -> io::Result<(TcpListener, TcpListener)> {
    if port != 0 {
        let command = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        let platform = TcpListener::bind((Ipv4Addr::LOCALHOST, port.wrapping_add(1)))?;
        return Ok((command, platform));
    }
    for _ in 0..BIND_ATTEMPTS {
        let command = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let Some(next) = command.local_addr()?.port().checked_add(1) else {
            continue;
        };
        if let Ok(platform) = TcpListener::bind((Ipv4Addr::LOCALHOST, next)) {
            return Ok((command, platform));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free pair of adjacent ports",
    ))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut raw = [0u8; 4];
    reader.read_exact(&mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

/// Acknowledges platform signals until the client ends the session.
fn serve_platform(mut stream: TcpStream) {
    loop {
        match read_u32(&mut stream) {
            Ok(TPM_SESSION_END) | Err(_) => break,
            Ok(signal) => {
                info!("platform signal {signal}");
                if stream.write_all(&0u32.to_be_bytes()).is_err() {
                    break;
                }
            }
        }
    }
}

fn serve_command(mut stream: TcpStream, state: &mut MockTpm) -> io::Result<()> {
    loop {
        let request = match read_u32(&mut stream) {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match request {
            TPM_SEND_COMMAND => {
                let mut locality = [0u8; 1];
                stream.read_exact(&mut locality)?;
                let len = read_u32(&mut stream)? as usize;
                let mut command = vec![0u8; len];
                stream.read_exact(&mut command)?;

                let response = state.execute(&command);
                let len = u32::try_from(response.len())
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "response size"))?;
                let mut frame = Vec::with_capacity(response.len() + 8);
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(&response);
                frame.extend_from_slice(&0u32.to_be_bytes());
                stream.write_all(&frame)?;
                stream.flush()?;
            }
            TPM_SESSION_END => return Ok(()),
            other => {
                warn!("unsupported request {other}");
                stream.write_all(&0u32.to_be_bytes())?;
            }
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args = Args::parse();
    let mut state = MockTpm::new();
    for arg in &args.nv {
        let defined = parse_nv(arg).and_then(|(handle, data)| {
            state
                .define_nv(handle, &data)
                .map_err(|rc| format!("{handle:#010x}: {rc}"))
        });
        if let Err(e) = defined {
            error!("{e}");
            std::process::exit(1);
        }
    }

    let (command_listener, platform_listener) = match bind_pair(args.port) {
        Ok(pair) => pair,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let port = match command_listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    println!("listening on 127.0.0.1:{port}");
    if io::stdout().flush().is_err() {
        std::process::exit(1);
    }

    for stream in command_listener.incoming() {
        let command = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("Accepting connection failed: {e}");
                continue;
            }
        };
        let platform = match platform_listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("Accepting platform connection failed: {e}");
                continue;
            }
        };
        info!("Accepted connection");
        let platform_thread = thread::spawn(move || serve_platform(platform));
        if let Err(e) = serve_command(command, &mut state) {
            error!("{e}");
        }
        if platform_thread.join().is_err() {
            error!("platform channel panicked");
        }
        info!("Client disconnected");
    }
}
