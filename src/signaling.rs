//! Signaling server protocol: REST endpoints, request bodies, and the event
//! stream decoded into [`ServerEvent`].

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::peer::types::{IceCandidate, MediaKind, Participant};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

/// Every REST resource the client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    CreateRoom,
    DeleteRoom { room_id: String },
    IceCandidates,
    CreateUser,
    AddParticipant,
    TurnCredentials { user_id: String },
    Events { session_id: String, user_id: String },
    Join { room_hash: String },
    Joined { user_id: String },
    Leave { session_id: String, user_id: String },
    DeleteSession { room_id: String, creator_token: Option<String> },
    MediaStatus { session_id: String },
    MuteAll { session_id: String, user_id: String },
    Offer,
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Self::CreateRoom => "/api/rooms".to_owned(),
            Self::DeleteRoom { room_id } => format!("/api/rooms/{room_id}"),
            Self::IceCandidates => "/api/iceCandidates".to_owned(),
            Self::CreateUser => "/api/users".to_owned(),
            Self::AddParticipant => "/api/participants".to_owned(),
            Self::TurnCredentials { user_id } => format!("/api/turn/{user_id}"),
            Self::Events { session_id, user_id } => {
                format!("/api/sessions/{session_id}/users/{user_id}/events")
            }
            Self::Join { room_hash } => format!("/api/sessions/{room_hash}/notify"),
            Self::Joined { user_id } => format!("/api/users/{user_id}/notify"),
            Self::Leave { session_id, user_id } => {
                format!("/api/sessions/{session_id}/users/{user_id}")
            }
            Self::DeleteSession {
                room_id,
                creator_token: Some(token),
            } => format!("/api/rooms/{room_id}/{token}"),
            Self::DeleteSession {
                room_id,
                creator_token: None,
            } => format!("/api/rooms/{room_id}"),
            Self::MediaStatus { session_id } => format!("/api/sessions/{session_id}/media-status"),
            Self::MuteAll {
                session_id,
                user_id,
            } => format!("/api/sessions/{session_id}/{user_id}/mute-all"),
            Self::Offer => "/api/offers".to_owned(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone)]
pub struct SignalingResponse {
    pub status: u16,
    pub body: Bytes,
}

impl SignalingResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `None` for an empty body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.body)?))
    }
}

/// Request/response channel to the signaling server.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: Option<Value>,
        method: HttpMethod,
    ) -> Result<SignalingResponse>;
}

/// JSON-over-HTTP signaling. `ureq` is blocking, so each request runs on
/// the blocking pool.
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    base_url: String,
    token: Option<String>,
}

impl HttpSignaling {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.base_url(), config.token.clone())
    }

    pub fn url(&self, endpoint: &Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

fn apply_headers<B>(
    req: ureq::RequestBuilder<B>,
    token: Option<&str>,
) -> ureq::RequestBuilder<B> {
    let req = req.header("Content-Type", "application/json");
    match token {
        Some(token) => req.header("Authorization", token),
        None => req,
    }
}

#[async_trait]
impl SignalingChannel for HttpSignaling {
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: Option<Value>,
        method: HttpMethod,
    ) -> Result<SignalingResponse> {
        let url = self.url(endpoint);
        let token = self.token.clone();
        let body = payload.map(|p| serde_json::to_vec(&p)).transpose()?;
        debug!("{} {}", method.as_str(), url);

        tokio::task::spawn_blocking(move || -> Result<SignalingResponse> {
            let token = token.as_deref();
            let response = match method {
                HttpMethod::Get => apply_headers(ureq::get(&url), token).call()?,
                HttpMethod::Delete => apply_headers(ureq::delete(&url), token).call()?,
                HttpMethod::Post => {
                    let req = apply_headers(ureq::post(&url), token);
                    req.send(body.as_deref().unwrap_or_default())?
                }
            };

            let status = response.status().as_u16();
            let body = response.into_body().read_to_vec()?;
            trace!("{} -> {} ({} bytes)", url, status, body.len());
            Ok(SignalingResponse::new(status, body))
        })
        .await?
    }
}

/// Offer transmitted for both publish and subscribe negotiations.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferMessage {
    pub sdp_offer: String,
    pub type_message: &'static str,
    pub caller_user_id: String,
    pub callee_user_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Participant>,
}

impl OfferMessage {
    pub fn new(sdp_offer: String, caller: &str, callee: &str, session_id: &str) -> Self {
        Self {
            sdp_offer,
            type_message: "OFFER",
            caller_user_id: caller.to_owned(),
            callee_user_id: callee.to_owned(),
            session_id: session_id.to_owned(),
            user: None,
        }
    }
}

/// Locally gathered candidate sent upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMessage {
    pub type_message: &'static str,
    pub candidate: String,
    pub caller_user_id: String,
    pub callee_user_id: String,
    pub session_id: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateMessage {
    pub fn new(candidate: &IceCandidate, caller: &str, callee: &str, session_id: &str) -> Self {
        Self {
            type_message: "ICE_CANDIDATE",
            candidate: candidate.candidate.clone(),
            caller_user_id: caller.to_owned(),
            callee_user_id: callee.to_owned(),
            session_id: session_id.to_owned(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusMessage {
    pub user_id: String,
    pub media_type: MediaKind,
    pub new_status: bool,
}

/// Tells a remote participant that the local user is present.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedNotice {
    pub session_id: String,
    pub user: Participant,
}

/// Event record as delivered by the server, before classification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawEvent {
    pub type_message: Option<String>,
    pub exception_id: Option<String>,
    pub explanation: Option<String>,
    pub timestamp: Option<String>,
    pub answer: Option<String>,
    pub callee_user_id: Option<String>,
    pub user_id: Option<Vec<String>>,
    pub media_type: Option<String>,
    pub new_status: Option<bool>,
    pub user: Option<EventUser>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub sdp_mid: Option<String>,
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventUser {
    pub user_id: Option<String>,
    pub id: Option<String>,
    pub socket_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
    pub initials: Option<String>,
    pub media_type: Option<String>,
    pub new_status: Option<bool>,
}

impl EventUser {
    pub fn participant_id(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn into_participant(self) -> Result<Participant> {
        let id = self
            .participant_id()
            .ok_or(CallError::MalformedEvent("user.userId"))?
            .to_owned();
        Ok(Participant {
            id,
            user_name: self.user_name,
            first_name: self.first_name,
            last_name: self.last_name,
            initials: self.initials,
            avatar: self.avatar,
            email: self.email,
        })
    }
}

/// Server event, classified once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Answer {
        participant_id: String,
        sdp: String,
    },
    IceCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    Joined(Participant),
    Join(Participant),
    Reconnect(Participant),
    CloseSession,
    CloseConnection {
        participant_ids: Vec<String>,
    },
    UpdateUserMediaStatus {
        participant_id: String,
        kind: MediaKind,
        status: bool,
    },
    MuteAllUsersAudio {
        participant_ids: Vec<String>,
    },
}

impl ServerEvent {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Answer { .. } => "ANSWER",
            Self::IceCandidate { .. } => "ICE_CANDIDATE",
            Self::Joined(_) => "JOINED",
            Self::Join(_) => "JOIN",
            Self::Reconnect(_) => "RECONNECT",
            Self::CloseSession => "CLOSE_SESSION",
            Self::CloseConnection { .. } => "CLOSE_CONNECTION",
            Self::UpdateUserMediaStatus { .. } => "UPDATE_USER_MEDIA_STATUS",
            Self::MuteAllUsersAudio { .. } => "MUTE_ALL_USERS_AUDIO",
        }
    }
}

impl TryFrom<RawEvent> for ServerEvent {
    type Error = CallError;

    fn try_from(raw: RawEvent) -> Result<Self> {
        let tag = raw
            .type_message
            .ok_or(CallError::MalformedEvent("typeMessage"))?;

        match tag.as_str() {
            "ANSWER" => Ok(Self::Answer {
                participant_id: raw
                    .callee_user_id
                    .ok_or(CallError::MalformedEvent("calleeUserId"))?,
                sdp: raw.answer.ok_or(CallError::MalformedEvent("answer"))?,
            }),
            "ICE_CANDIDATE" => Ok(Self::IceCandidate {
                participant_id: raw
                    .callee_user_id
                    .ok_or(CallError::MalformedEvent("calleeUserId"))?,
                candidate: IceCandidate {
                    candidate: raw.candidate.ok_or(CallError::MalformedEvent("candidate"))?,
                    sdp_mid: raw.sdp_mid,
                    sdp_mline_index: Some(raw.sdp_mline_index.unwrap_or(0)),
                },
            }),
            "JOINED" => Ok(Self::Joined(required_user(raw.user)?)),
            "JOIN" => Ok(Self::Join(required_user(raw.user)?)),
            "RECONNECT" => Ok(Self::Reconnect(required_user(raw.user)?)),
            "CLOSE_SESSION" => Ok(Self::CloseSession),
            "CLOSE_CONNECTION" => Ok(Self::CloseConnection {
                participant_ids: raw.user_id.ok_or(CallError::MalformedEvent("userId"))?,
            }),
            "UPDATE_USER_MEDIA_STATUS" => {
                let user = raw.user.ok_or(CallError::MalformedEvent("user"))?;
                let participant_id = user
                    .participant_id()
                    .ok_or(CallError::MalformedEvent("user.userId"))?
                    .to_owned();
                let kind = user
                    .media_type
                    .or(raw.media_type)
                    .as_deref()
                    .and_then(MediaKind::parse)
                    .ok_or(CallError::MalformedEvent("mediaType"))?;
                let status = user
                    .new_status
                    .or(raw.new_status)
                    .ok_or(CallError::MalformedEvent("newStatus"))?;
                Ok(Self::UpdateUserMediaStatus {
                    participant_id,
                    kind,
                    status,
                })
            }
            "MUTE_ALL_USERS_AUDIO" => Ok(Self::MuteAllUsersAudio {
                participant_ids: raw.user_id.unwrap_or_default(),
            }),
            _ => Err(CallError::UnrecognizedEvent(tag.clone())),
        }
    }
}

fn required_user(user: Option<EventUser>) -> Result<Participant> {
    user.ok_or(CallError::MalformedEvent("user"))?
        .into_participant()
}

/// Decodes one fetch body: a JSON array of strings, each string an encoded
/// event. A bad entry yields an `Err` in its place without affecting siblings.
pub fn decode_events(body: &[u8]) -> Result<Vec<Result<ServerEvent>>> {
    let entries: Vec<String> = serde_json::from_slice(body)?;
    Ok(entries
        .iter()
        .map(|entry| {
            let raw: RawEvent = serde_json::from_str(entry)?;
            ServerEvent::try_from(raw)
        })
        .collect())
}

/// The join-notify response body is the bare session id.
pub fn parse_session_id(body: &str) -> Option<String> {
    let id = body.trim().trim_matches('"').trim();
    (!id.is_empty()).then(|| id.to_owned())
}
