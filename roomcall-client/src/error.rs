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

//! Error taxonomy of the call client.

use thiserror::Error;

/// Camera, microphone or display capture failed. Fatal to the requested
/// operation; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("permission to capture {0} was denied")]
    PermissionDenied(String),
    #[error("{0} capture is unavailable")]
    Unavailable(String),
}

/// The signaling relay could not be reached or dropped the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalChannelError {
    #[error("failed to connect to signaling relay: {0}")]
    Connect(String),
    #[error("failed to subscribe to room topic: {0}")]
    Subscribe(String),
    #[error("failed to publish signal: {0}")]
    Publish(String),
    #[error("signal channel is not connected")]
    NotConnected,
    #[error("signal channel closed")]
    Closed,
}

/// A negotiation step for a single peer failed. The session carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("peer connection is closed")]
    ConnectionClosed,
    #[error("peer connection backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),
    #[error(transparent)]
    Signal(#[from] SignalChannelError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("not joined to a room")]
    NotJoined,
    #[error("already joined to a room")]
    AlreadyJoined,
    #[error("join was cancelled by leave")]
    JoinCancelled,
    #[error("signal payload error: {0}")]
    Payload(#[from] serde_json::Error),
}
