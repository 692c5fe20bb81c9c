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

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use roomcall_client::DEFAULT_SIGNALING_URL;
use url::Url;

/// Room Call CLI
///
/// Joins a room on a roomcall signaling relay as a headless participant.
/// Lines typed on stdin are sent as chat; lines starting with `/` are
/// commands (`/help` lists them).
#[derive(Parser, Debug)]
#[clap(name = "roomcall-cli")]
pub struct Opt {
    #[clap(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Join a room and stay until `/leave`, Ctrl-C or a kick.
    Join(Join),
}

#[derive(Args, Debug, Clone)]
pub struct Join {
    #[clap(long = "room")]
    pub room: String,

    /// Name shown to the other participants. Defaults to the name stored in
    /// the credentials file, then to "Guest".
    #[clap(long = "name")]
    pub name: Option<String>,

    /// WebSocket URL of the STOMP relay.
    #[clap(long = "url", env = "ROOMCALL_SIGNALING_URL", default_value = DEFAULT_SIGNALING_URL)]
    pub url: Url,

    /// STUN/TURN server URLs. May be repeated or comma separated.
    #[clap(long = "ice", env = "ROOMCALL_ICE_SERVERS", value_delimiter = ',')]
    pub ice: Vec<String>,

    /// JSON file holding the signed-in user's record.
    #[clap(long = "credentials")]
    pub credentials: Option<PathBuf>,

    /// Participant id to use instead of a random one.
    #[clap(long = "user-id")]
    pub user_id: Option<String>,
}
