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

//! Signaling transport for roomcall.
//!
//! - [`stomp`] encodes and decodes STOMP 1.2 frames.
//! - [`native_stomp`] runs a STOMP session over `tokio-tungstenite`.

pub mod native_stomp;
pub mod stomp;

pub use native_stomp::{host_header, StompClient, StompConnectError, StompSendError};
pub use stomp::{StompCommand, StompError, StompFrame};
