//! Non-interactive command execution.
//!
//! Runs each command on its own session channel, similar to
//! `ssh user@host command`, printing stdout and stderr as they arrive.
//!
//! Usage:
//!   cargo run --example execute_command <host:port> <username> <password> <command1> [command2] [...]
//!
//! Example:
//!   RUST_LOG=debug cargo run --example execute_command 127.0.0.1:2222 admin secret "whoami" "pwd"

use std::env;
use std::io::Write;
use std::time::Duration;

use conduit_proto::ssh::{
    ChannelEvent, ChannelRequestType, DisconnectReason, ExtendedDataType, PasswordAuth, SshClient, SshClientConfig,
};
use tokio::time::timeout;

/// Runs one command and streams its output.
async fn execute_command(client: &SshClient, command: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("$ {}", command);

    let mut channel = client.open_session().await?;
    channel.exec(command).await?;

    loop {
        let event = match timeout(Duration::from_secs(30), channel.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                eprintln!("Command timed out after 30 seconds");
                channel.close().await?;
                return Err("command timeout".into());
            }
        };

        match event {
            ChannelEvent::Data(data) => std::io::stdout().write_all(&data)?,
            ChannelEvent::ExtendedData { data_type, data }
                if data_type == ExtendedDataType::Stderr as u32 =>
            {
                std::io::stderr().write_all(&data)?
            }
            ChannelEvent::Request { request, .. } => {
                if let Some(status) = exit_status(&request) {
                    println!("[exit status {}]", status);
                }
            }
            ChannelEvent::Eof => channel.close().await?,
            ChannelEvent::Closed => break,
            ChannelEvent::ExtendedData { .. } => {}
        }
    }
    Ok(())
}

fn exit_status(request: &ChannelRequestType) -> Option<u32> {
    match request {
        ChannelRequestType::ExitStatus { exit_status } => Some(*exit_status),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <command1> [command2] [...]",
            args[0]
        );
        std::process::exit(1);
    }

    let server_addr = &args[1];
    let mut auth = PasswordAuth::new(&args[2], &args[3]);
    let commands = &args[4..];

    let mut client = SshClient::connect(server_addr.as_str(), SshClientConfig::default(), &mut auth).await?;
    println!(
        "Connected to {} ({})",
        server_addr,
        client.server_version().software()
    );

    let mut failures = 0;
    for command in commands {
        if let Err(e) = execute_command(&client, command).await {
            eprintln!("Error executing '{}': {}", command, e);
            failures += 1;
        }
    }

    client
        .disconnect(DisconnectReason::ByApplication, "done")
        .await;
    println!("{} of {} commands succeeded", commands.len() - failures, commands.len());
    Ok(())
}
