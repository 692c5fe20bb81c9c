/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use std::sync::Arc;

use anyhow::Context;
use roomcall_cli::cli_args::Join;
use roomcall_cli::commands::{Command, ParseCommandError, HELP};
use roomcall_client::{
    CallConfig, CallSessionController, CallSessionOptions, ChatMessage, ClientEvent,
    CredentialStore, FileCredentialStore, HostAction, HostActionEvent, IceServer,
    MemoryCredentialStore, ParticipantId, PresenceEvent, RtcPeerConnectionFactory,
    StompSignalChannel, SyntheticMediaDevices,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DEFAULT_NAME: &str = "Guest";

fn call_config(args: &Join) -> CallConfig {
    let mut config = CallConfig::from_env();
    config.signaling_url = args.url.to_string();
    if !args.ice.is_empty() {
        config.ice_servers = args.ice.iter().map(IceServer::new).collect();
    }
    config
}

fn display_name(args: &Join) -> anyhow::Result<String> {
    if let Some(name) = args.name.as_ref().filter(|n| !n.trim().is_empty()) {
        return Ok(name.trim().to_string());
    }
    let store: Box<dyn CredentialStore> = match &args.credentials {
        Some(path) => Box::new(FileCredentialStore::new(path)),
        None => Box::new(MemoryCredentialStore::new()),
    };
    let record = store.load().context("failed to read credentials")?;
    Ok(record
        .map(|r| r.preferred_name().to_string())
        .unwrap_or_else(|| DEFAULT_NAME.to_string()))
}

pub async fn join(args: Join) -> anyhow::Result<()> {
    let config = call_config(&args);
    let name = display_name(&args)?;
    let local_id = args
        .user_id
        .clone()
        .map(ParticipantId::from)
        .unwrap_or_else(ParticipantId::generate);

    let factory = RtcPeerConnectionFactory::new(&config.ice_servers, &local_id)
        .context("failed to set up WebRTC")?;
    let controller = CallSessionController::new(CallSessionOptions {
        channel: Arc::new(StompSignalChannel::new(&config)),
        devices: Arc::new(SyntheticMediaDevices::new()),
        factory: Arc::new(factory),
        local_id: Some(local_id),
        config,
    });

    controller.on_chat(|message: ChatMessage| {
        println!("[{}] {}", message.sender_name, message.content);
    });
    controller.on_presence(|event: PresenceEvent| match event {
        PresenceEvent::Joined {
            participant,
            display_name,
            is_host,
        } => println!(
            "* {} joined{}",
            display_name.unwrap_or_else(|| participant.to_string()),
            if is_host { " (host)" } else { "" }
        ),
        PresenceEvent::Left { participant } => println!("* {participant} left"),
    });
    controller.on_host_action(|event: HostActionEvent| {
        debug!("{:?} from {} for {:?}", event.action, event.from, event.target);
    });

    let left = Arc::new(Notify::new());
    let mut events = controller.subscribe_events();
    let notify = left.clone();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(e) if events.is_closed() => {
                    debug!("event stream ended: {e}");
                    break;
                }
                Err(e) => {
                    warn!("missed events: {e}");
                    continue;
                }
            };
            match event {
                ClientEvent::Left { reason } => {
                    info!("left the room: {reason:?}");
                    notify.notify_one();
                }
                ClientEvent::ConnectionLost(reason) => warn!("connection lost: {reason}"),
                ClientEvent::ForcedMute { by } => warn!("muted by {by}"),
                ClientEvent::PeerStateChanged { peer_id, state } => info!("{peer_id}: {state}"),
                ClientEvent::RemoteTrackAdded { peer_id, track } => {
                    info!("{peer_id} sends {} track {}", track.kind, track.id)
                }
                other => debug!("{other:?}"),
            }
        }
    });

    controller.join(args.room.as_str(), name.as_str()).await?;
    println!(
        "Joined {} as {name} ({}). Type /help for commands.",
        args.room,
        controller.local_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = left.notified() => return Ok(()),
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match line.parse::<Command>() {
                    Ok(command) => command,
                    Err(ParseCommandError::Empty) => continue,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                if command == Command::Leave {
                    break;
                }
                if let Err(e) = run_command(&controller, command).await {
                    warn!("{e}");
                }
            }
        }
    }

    controller.leave().await;
    Ok(())
}

async fn run_command(controller: &CallSessionController, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Chat(text) => {
            controller.send_chat(text).await?;
        }
        Command::ToggleAudio => {
            let on = controller.toggle_audio()?;
            println!("microphone {}", if on { "on" } else { "off" });
        }
        Command::ToggleVideo => {
            let on = controller.toggle_video()?;
            println!("camera {}", if on { "on" } else { "off" });
        }
        Command::Share => controller.start_screen_share().await?,
        Command::Unshare => {
            if !controller.stop_screen_share().await? {
                println!("not sharing");
            }
        }
        Command::Mute(id) => {
            controller
                .send_host_action(HostAction::Mute, &ParticipantId::from(id))
                .await?
        }
        Command::Kick(id) => {
            controller
                .send_host_action(HostAction::Kick, &ParticipantId::from(id))
                .await?
        }
        Command::Peers => {
            let participants = controller.participants().await;
            if participants.is_empty() {
                println!("nobody else is here");
            }
            for p in participants {
                println!(
                    "{} {} [{}]{}",
                    p.id,
                    p.display_name.as_deref().unwrap_or("-"),
                    p.state,
                    if p.is_host { " host" } else { "" }
                );
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Leave => {}
    }
    Ok(())
}
