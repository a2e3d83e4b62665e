//! Headless shell for the lanroom node.
//!
//! Drives the runtime from stdin and prints events to the terminal:
//!
//! ```text
//! lanroom [--dev] [room]
//! ```
//!
//! Bare input lines are sent as chat messages. Commands: `/join <room>`,
//! `/send <path>`, `/peers`, `/leave`, `/quit`. Completed file transfers
//! are written to the configured download directory. `--dev` raises the
//! log level to debug.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use lanroom::config::Config;
use lanroom::runtime::messages::{ChatMessage, FilePayload, MessagePart};
use lanroom::runtime::{spawn_runtime, RuntimeEvent, RuntimeHandle};

fn setup_logger(dev_mode: bool) -> Result<()> {
    let term_level = if dev_mode {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new().build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        term_level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Ok(log_file) = File::create("lanroom.log") {
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, log_file));
    }

    CombinedLogger::init(loggers).ok();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let dev_mode = args.iter().any(|a| a == "--dev");
    setup_logger(dev_mode)?;

    let cfg = Config::load().context("loading lanroom.toml")?;
    let display_name = cfg
        .display_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            hostname::get()
                .ok()
                .and_then(|name| name.into_string().ok())
        })
        .unwrap_or_default();

    let (handle, events) = spawn_runtime();
    tokio::spawn(print_events(events, cfg.download_dir.clone()));

    let initial_room = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .or(cfg.default_room);
    if let Some(room) = initial_room {
        join(&handle, &room, &display_name).await;
    } else {
        println!("no room yet — use /join <room>");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/join", room) if !room.is_empty() => join(&handle, room, &display_name).await,
            ("/join", _) => println!("usage: /join <room>"),
            ("/leave", _) => {
                handle.leave_room().await?;
            }
            ("/peers", _) => match handle.get_peers().await {
                Ok(peers) if peers.is_empty() => println!("no peers in sight"),
                Ok(peers) => {
                    for peer in peers {
                        println!("  {} ({})", peer.display_name, peer.peer_id);
                    }
                }
                Err(err) => eprintln!("error: {err}"),
            },
            ("/send", path) if !path.is_empty() => send_file(&handle, Path::new(path)).await,
            ("/send", _) => println!("usage: /send <path>"),
            _ => {
                let result = handle
                    .send_message(
                        vec![MessagePart::Text {
                            content: line.to_string(),
                        }],
                        vec![],
                    )
                    .await;
                match result {
                    Ok(message) => println!("{}", render_message(&message)),
                    Err(err) => eprintln!("error: {err}"),
                }
            }
        }
    }

    handle.shutdown().await.ok();
    Ok(())
}

async fn join(handle: &RuntimeHandle, room: &str, display_name: &str) {
    match handle.join_room(room, display_name).await {
        Ok(port) => println!("joined '{room}' (udp port {port})"),
        Err(err) => eprintln!("could not join '{room}': {err}"),
    }
}

/// Read a file, base64-encode it (the wire convention for chunk payloads),
/// and send it as a message with a single file reference.
async fn send_file(handle: &RuntimeHandle, path: &Path) {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("could not read {}: {err}", path.display());
            return;
        }
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let payload = FilePayload {
        id: Uuid::new_v4().simple().to_string(),
        name: name.clone(),
        data: BASE64.encode(&bytes),
    };

    let result = handle
        .send_message(
            vec![MessagePart::File {
                id: payload.id.clone(),
            }],
            vec![payload],
        )
        .await;
    match result {
        Ok(_) => println!("sent '{name}' ({} bytes)", bytes.len()),
        Err(err) => eprintln!("error: {err}"),
    }
}

async fn print_events(
    mut events: tokio::sync::mpsc::Receiver<RuntimeEvent>,
    download_dir: PathBuf,
) {
    while let Some(event) = events.recv().await {
        match event {
            RuntimeEvent::NewMessage(message) => println!("{}", render_message(&message)),
            RuntimeEvent::FileChunkReceived {
                file_id,
                received,
                total_chunks,
                ..
            } => {
                log::debug!("file {file_id}: {received}/{total_chunks} chunks");
            }
            RuntimeEvent::FileReceived {
                name,
                data,
                file_id,
            } => save_file(&download_dir, &name, &file_id, &data).await,
            RuntimeEvent::PeersChanged(peers) => {
                log::debug!("peer table now holds {} entries", peers.len());
            }
            RuntimeEvent::Status(status) => println!("* {status}"),
            RuntimeEvent::Error(message) => eprintln!("error: {message}"),
        }
    }
}

/// Write a completed transfer into the download directory. The payload is
/// base64 text by convention; anything that fails to decode is written
/// verbatim.
async fn save_file(download_dir: &Path, name: &str, file_id: &str, data: &str) {
    // Only the file name component: an announced name must not be able to
    // escape the download directory.
    let safe_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_id.to_string());
    let target = download_dir.join(safe_name);

    let bytes = BASE64
        .decode(data.as_bytes())
        .unwrap_or_else(|_| data.as_bytes().to_vec());

    if let Err(err) = tokio::fs::create_dir_all(download_dir).await {
        eprintln!("could not create {}: {err}", download_dir.display());
        return;
    }
    match tokio::fs::write(&target, bytes).await {
        Ok(()) => println!("* saved file to {}", target.display()),
        Err(err) => eprintln!("could not save {}: {err}", target.display()),
    }
}

fn render_message(message: &ChatMessage) -> String {
    let mut body = String::new();
    for part in &message.structure {
        match part {
            MessagePart::Text { content } => body.push_str(content),
            MessagePart::File { id } => {
                match message.files.iter().find(|meta| &meta.id == id) {
                    Some(meta) => {
                        body.push_str(&format!("[file {} ({} bytes)]", meta.name, meta.size))
                    }
                    None => body.push_str(&format!("[file {id}]")),
                }
            }
        }
    }
    format!("<{}> {}", message.sender, body)
}
