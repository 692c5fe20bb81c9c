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

pub static DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080/ws";
pub static DEFAULT_PUBLISH_DESTINATION: &str = "/app/signal";
pub static DEFAULT_ROOM_TOPIC_PREFIX: &str = "/topic/room/";
pub static DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const INBOUND_BUFFER: usize = 100;

pub static AUDIO_MIME_TYPE: &str = "audio/opus";
pub static VIDEO_MIME_TYPE: &str = "video/VP8";

pub const AUDIO_CHANNELS: u16 = 1;
pub const AUDIO_SAMPLE_RATE: u32 = 48000;
pub const VIDEO_CLOCK_RATE: u32 = 90000;

pub static SIGNALING_URL_ENV: &str = "ROOMCALL_SIGNALING_URL";
pub static ICE_SERVERS_ENV: &str = "ROOMCALL_ICE_SERVERS";
