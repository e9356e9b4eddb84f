//! All effectlink protocol value types.
//!
//! A [`Request`] travels from the requester to the executor; a [`Response`]
//! travels back.  Both are immutable once built: the only way to obtain one
//! is through a validating constructor ([`Request::new`] / [`Response::new`])
//! that takes a plain configuration struct with every optional field spelled
//! out.  To "modify" a value, copy its config out with `to_config()`, change
//! the fields, and construct a new value.
//!
//! Enum-like fields ([`RequestType`], [`PacketType`], [`ResultType`]) carry a
//! fixed wire byte per variant.  The bytes are explicit discriminants, not
//! ordinal positions, so adding a variant never renumbers an existing one.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Request types ─────────────────────────────────────────────────────────────

/// The kind of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    /// Asks whether an effect could run right now, without running it.
    Test = 0x00,
    /// Starts an effect.
    Start = 0x01,
    /// Stops a running effect.
    Stop = 0x02,
    /// Carries the result of a remote function invoked by the executor.
    RemoteFunctionResult = 0xD0,
    /// Announces the player (streamer) the executor is running for.
    PlayerInfo = 0xE0,
    /// Handshake: presents the hashed password.
    Login = 0xF0,
    /// Liveness probe; always answered, never dispatched.
    KeepAlive = 0xFF,
}

impl RequestType {
    /// Returns the fixed wire byte of this variant.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` for request types that name an effect.
    pub const fn is_effect_type(self) -> bool {
        matches!(self, RequestType::Test | RequestType::Start | RequestType::Stop)
    }

    /// Returns `true` for protocol-internal requests that never reach a dispatcher.
    pub const fn is_internal(self) -> bool {
        matches!(self, RequestType::Login | RequestType::KeepAlive)
    }

    /// Upper-snake name used in log lines and validation messages.
    pub const fn name(self) -> &'static str {
        match self {
            RequestType::Test => "TEST",
            RequestType::Start => "START",
            RequestType::Stop => "STOP",
            RequestType::RemoteFunctionResult => "REMOTE_FUNCTION_RESULT",
            RequestType::PlayerInfo => "PLAYER_INFO",
            RequestType::Login => "LOGIN",
            RequestType::KeepAlive => "KEEP_ALIVE",
        }
    }
}

impl TryFrom<u8> for RequestType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(RequestType::Test),
            0x01 => Ok(RequestType::Start),
            0x02 => Ok(RequestType::Stop),
            0xD0 => Ok(RequestType::RemoteFunctionResult),
            0xE0 => Ok(RequestType::PlayerInfo),
            0xF0 => Ok(RequestType::Login),
            0xFF => Ok(RequestType::KeepAlive),
            _ => Err(()),
        }
    }
}

// ── Packet types ──────────────────────────────────────────────────────────────

/// Wire-level envelope kind of a [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Outcome of a specific request; `id` echoes the request id.
    EffectResult = 0x00,
    /// Out-of-band availability update for an effect (visibility, selectability).
    EffectStatus = 0x01,
    /// Handshake: the executor asks for the password.
    Login = 0xF0,
    /// Handshake: the password was accepted.
    LoginSuccess = 0xF1,
    /// The sender is closing the connection; `message` carries the reason.
    Disconnect = 0xFE,
    /// Reply to a keep-alive request.
    KeepAlive = 0xFF,
}

impl PacketType {
    /// Returns the fixed wire byte of this variant.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` if packets of this type carry a [`ResultType`].
    pub const fn has_result_type(self) -> bool {
        matches!(self, PacketType::EffectResult | PacketType::EffectStatus)
    }

    /// Returns `true` if packets of this type must carry a message.
    pub const fn is_message_required(self) -> bool {
        matches!(self, PacketType::Disconnect)
    }

    /// Returns `true` if the packet answers a specific request id.
    pub const fn is_effect_type(self) -> bool {
        matches!(self, PacketType::EffectResult)
    }

    /// Upper-snake name used in log lines and validation messages.
    pub const fn name(self) -> &'static str {
        match self {
            PacketType::EffectResult => "EFFECT_RESULT",
            PacketType::EffectStatus => "EFFECT_STATUS",
            PacketType::Login => "LOGIN",
            PacketType::LoginSuccess => "LOGIN_SUCCESS",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::KeepAlive => "KEEP_ALIVE",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::EffectResult),
            0x01 => Ok(PacketType::EffectStatus),
            0xF0 => Ok(PacketType::Login),
            0xF1 => Ok(PacketType::LoginSuccess),
            0xFE => Ok(PacketType::Disconnect),
            0xFF => Ok(PacketType::KeepAlive),
            _ => Err(()),
        }
    }
}

// ── Result types ──────────────────────────────────────────────────────────────

/// Outcome carried by `EFFECT_RESULT` and `EFFECT_STATUS` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultType {
    Success = 0x00,
    Failure = 0x01,
    Unavailable = 0x02,
    /// Temporarily impossible; the requester may try again later.
    Retry = 0x03,
    Paused = 0x06,
    Resumed = 0x07,
    Finished = 0x08,
    Visible = 0x80,
    NotVisible = 0x81,
    Selectable = 0x82,
    NotSelectable = 0x83,
    /// The executor has not finished its handshake.
    NotReady = 0xFF,
}

impl ResultType {
    /// Returns the fixed wire byte of this variant.
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns `true` for the effect-status variants, which are only valid on
    /// `EFFECT_STATUS` packets.
    pub const fn is_status(self) -> bool {
        matches!(
            self,
            ResultType::Visible
                | ResultType::NotVisible
                | ResultType::Selectable
                | ResultType::NotSelectable
        )
    }

    /// Returns `true` if no further responses follow for the same request.
    pub const fn is_terminating(self) -> bool {
        matches!(
            self,
            ResultType::Failure
                | ResultType::Unavailable
                | ResultType::Finished
                | ResultType::NotReady
        )
    }

    /// Upper-snake name used in log lines and validation messages.
    pub const fn name(self) -> &'static str {
        match self {
            ResultType::Success => "SUCCESS",
            ResultType::Failure => "FAILURE",
            ResultType::Unavailable => "UNAVAILABLE",
            ResultType::Retry => "RETRY",
            ResultType::Paused => "PAUSED",
            ResultType::Resumed => "RESUMED",
            ResultType::Finished => "FINISHED",
            ResultType::Visible => "VISIBLE",
            ResultType::NotVisible => "NOT_VISIBLE",
            ResultType::Selectable => "SELECTABLE",
            ResultType::NotSelectable => "NOT_SELECTABLE",
            ResultType::NotReady => "NOT_READY",
        }
    }
}

impl TryFrom<u8> for ResultType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ResultType::Success),
            0x01 => Ok(ResultType::Failure),
            0x02 => Ok(ResultType::Unavailable),
            0x03 => Ok(ResultType::Retry),
            0x06 => Ok(ResultType::Paused),
            0x07 => Ok(ResultType::Resumed),
            0x08 => Ok(ResultType::Finished),
            0x80 => Ok(ResultType::Visible),
            0x81 => Ok(ResultType::NotVisible),
            0x82 => Ok(ResultType::Selectable),
            0x83 => Ok(ResultType::NotSelectable),
            0xFF => Ok(ResultType::NotReady),
            _ => Err(()),
        }
    }
}

// ── Validation errors ─────────────────────────────────────────────────────────

/// A request or response config violated a protocol invariant.
///
/// These are programmer errors: they surface before any packet is written.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field that must be present is absent.
    #[error("`{field}` is required on {kind} packets")]
    MissingField { field: &'static str, kind: &'static str },

    /// A field is present on a packet kind that must not carry it.
    #[error("`{field}` is not allowed on {kind} packets")]
    FieldNotAllowed { field: &'static str, kind: &'static str },

    /// Only `EFFECT_RESULT` packets may carry a non-zero id.
    #[error("{kind} packets must have id 0, got {id}")]
    NonZeroId { kind: &'static str, id: u32 },

    /// The result type does not belong on this packet type.
    #[error("{result} is not a valid result for {kind} packets")]
    ResultMismatch { kind: &'static str, result: &'static str },

    /// A numeric or duration field must be strictly positive.
    #[error("`{0}` must be greater than zero")]
    NotPositive(&'static str),
}

// ── Target ────────────────────────────────────────────────────────────────────

/// Identity of an effect recipient (typically a streamer on some service).
///
/// `PartialEq` is strict, field-for-field equality.  Use [`Target::rough_eq`]
/// to match the same person seen through slightly different metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_user_id: Option<String>,
}

impl Target {
    /// Creates a target identified only by `id`.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Loose equality: matching `id`s or matching platform user ids are
    /// enough; otherwise falls back to strict equality.
    pub fn rough_eq(&self, other: &Target) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            if a == b {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (&self.platform_user_id, &other.platform_user_id) {
            if a == b {
                return true;
            }
        }
        self == other
    }

    /// Key under which this target is tracked by the effect scheduler.
    ///
    /// Prefers the stable identifiers; falls back to display fields, and to
    /// the empty string for a target with no identifying data at all.
    pub fn key(&self) -> String {
        self.id
            .as_deref()
            .or(self.platform_user_id.as_deref())
            .or(self.name.as_deref())
            .or(self.login.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Plain field set used to construct a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub id: u32,
    pub request_type: RequestType,
    pub effect: Option<String>,
    pub viewer: Option<String>,
    pub cost: Option<u32>,
    pub targets: Vec<Target>,
    pub duration: Option<Duration>,
    pub message: Option<String>,
    pub value: Option<serde_json::Value>,
    pub quantity: Option<u32>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub player: Option<Target>,
}

impl RequestConfig {
    /// Returns a config of the given type with every optional field empty.
    pub fn new(request_type: RequestType) -> Self {
        Self {
            id: 0,
            request_type,
            effect: None,
            viewer: None,
            cost: None,
            targets: Vec::new(),
            duration: None,
            message: None,
            value: None,
            quantity: None,
            login: None,
            password: None,
            player: None,
        }
    }

    /// Returns a config for an effect request of the given type.
    pub fn effect(request_type: RequestType, effect: impl Into<String>) -> Self {
        Self {
            effect: Some(effect.into()),
            ..Self::new(request_type)
        }
    }
}

/// An immutable, validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    config: RequestConfig,
}

impl Request {
    /// Validates `config` and builds a request from it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the fields are inconsistent with the
    /// request type (e.g. an effect request without an effect name, or a
    /// keep-alive carrying targets).
    ///
    /// A JSON `null` value is stored as no value, the same as it decodes.
    pub fn new(mut config: RequestConfig) -> Result<Self, ValidationError> {
        let kind = config.request_type.name();
        if config.value.as_ref().is_some_and(serde_json::Value::is_null) {
            config.value = None;
        }

        if config.request_type.is_effect_type() {
            if config.effect.as_deref().map_or(true, str::is_empty) {
                return Err(ValidationError::MissingField { field: "effect", kind });
            }
        } else {
            let forbidden = [
                ("effect", config.effect.is_some()),
                ("viewer", config.viewer.is_some()),
                ("cost", config.cost.is_some()),
                ("targets", !config.targets.is_empty()),
                ("quantity", config.quantity.is_some()),
            ];
            if let Some((field, _)) = forbidden.iter().find(|(_, present)| *present) {
                return Err(ValidationError::FieldNotAllowed { field, kind });
            }
        }

        if config.request_type != RequestType::Login {
            if config.login.is_some() {
                return Err(ValidationError::FieldNotAllowed { field: "login", kind });
            }
            if config.password.is_some() {
                return Err(ValidationError::FieldNotAllowed { field: "password", kind });
            }
        }

        match (config.request_type, config.player.is_some()) {
            (RequestType::PlayerInfo, false) => {
                return Err(ValidationError::MissingField { field: "player", kind })
            }
            (RequestType::PlayerInfo, true) | (_, false) => {}
            (_, true) => return Err(ValidationError::FieldNotAllowed { field: "player", kind }),
        }

        if config.duration.is_some_and(|d| d.is_zero()) {
            return Err(ValidationError::NotPositive("duration"));
        }
        if config.quantity == Some(0) {
            return Err(ValidationError::NotPositive("quantity"));
        }

        Ok(Self { config })
    }

    /// Builds a keep-alive request (id 0).
    pub fn keep_alive() -> Self {
        Self {
            config: RequestConfig::new(RequestType::KeepAlive),
        }
    }

    /// Builds a LOGIN request presenting an already-hashed password.
    pub fn login(password_hash: impl Into<String>) -> Self {
        Self {
            config: RequestConfig {
                message: Some(password_hash.into()),
                ..RequestConfig::new(RequestType::Login)
            },
        }
    }

    /// Returns a copy of this request carrying a different id.
    ///
    /// The id takes part in no validation rule, so this cannot fail.
    pub fn with_id(&self, id: u32) -> Self {
        let mut config = self.config.clone();
        config.id = id;
        Self { config }
    }

    /// Copies the fields back out so a modified request can be constructed.
    pub fn to_config(&self) -> RequestConfig {
        self.config.clone()
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn request_type(&self) -> RequestType {
        self.config.request_type
    }

    pub fn effect(&self) -> Option<&str> {
        self.config.effect.as_deref()
    }

    pub fn viewer(&self) -> Option<&str> {
        self.config.viewer.as_deref()
    }

    pub fn cost(&self) -> Option<u32> {
        self.config.cost
    }

    /// Targets of the effect; empty means "global / all targets".
    pub fn targets(&self) -> &[Target] {
        &self.config.targets
    }

    /// Returns `true` when the request addresses every target.
    pub fn is_global(&self) -> bool {
        self.config.targets.is_empty()
    }

    /// Requester-suggested effect length.
    pub fn duration(&self) -> Option<Duration> {
        self.config.duration
    }

    pub fn message(&self) -> Option<&str> {
        self.config.message.as_deref()
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        self.config.value.as_ref()
    }

    pub fn quantity(&self) -> Option<u32> {
        self.config.quantity
    }

    pub fn login_name(&self) -> Option<&str> {
        self.config.login.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.config.password.as_deref()
    }

    pub fn player(&self) -> Option<&Target> {
        self.config.player.as_ref()
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// Plain field set used to construct a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseConfig {
    pub id: u32,
    pub packet_type: PacketType,
    pub result_type: Option<ResultType>,
    pub message: Option<String>,
    pub time_remaining: Option<Duration>,
    pub effect: Option<String>,
}

impl ResponseConfig {
    /// Returns a config of the given packet type with every optional field empty.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            id: 0,
            packet_type,
            result_type: None,
            message: None,
            time_remaining: None,
            effect: None,
        }
    }

    /// Returns an `EFFECT_RESULT` config answering `request`.
    pub fn for_request(request: &Request, result_type: ResultType) -> Self {
        Self {
            id: request.id(),
            result_type: Some(result_type),
            effect: request.effect().map(str::to_string),
            ..Self::new(PacketType::EffectResult)
        }
    }

    /// Returns an `EFFECT_STATUS` config announcing a status change of `effect`.
    pub fn status(effect: impl Into<String>, status: ResultType) -> Self {
        Self {
            result_type: Some(status),
            effect: Some(effect.into()),
            ..Self::new(PacketType::EffectStatus)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_time_remaining(mut self, remaining: Duration) -> Self {
        self.time_remaining = Some(remaining);
        self
    }

    /// Validates and builds the response.
    ///
    /// # Errors
    ///
    /// See [`Response::new`].
    pub fn build(self) -> Result<Response, ValidationError> {
        Response::new(self)
    }
}

/// An immutable, validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    config: ResponseConfig,
}

impl Response {
    /// Validates `config` and builds a response from it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the result type, message, id, effect
    /// or remaining time is inconsistent with the packet type.
    pub fn new(config: ResponseConfig) -> Result<Self, ValidationError> {
        let packet_type = config.packet_type;
        let kind = packet_type.name();

        match (packet_type.has_result_type(), config.result_type) {
            (true, None) => {
                return Err(ValidationError::MissingField { field: "status", kind })
            }
            (false, Some(_)) => {
                return Err(ValidationError::FieldNotAllowed { field: "status", kind })
            }
            (true, Some(result)) => {
                let status_packet = packet_type == PacketType::EffectStatus;
                if result.is_status() != status_packet {
                    return Err(ValidationError::ResultMismatch {
                        kind,
                        result: result.name(),
                    });
                }
            }
            (false, None) => {}
        }

        if packet_type.is_message_required() && config.message.is_none() {
            return Err(ValidationError::MissingField { field: "message", kind });
        }

        if !packet_type.is_effect_type() && config.id != 0 {
            return Err(ValidationError::NonZeroId { kind, id: config.id });
        }

        if packet_type == PacketType::EffectStatus && config.effect.is_none() {
            return Err(ValidationError::MissingField { field: "effect", kind });
        }

        if let Some(remaining) = config.time_remaining {
            if packet_type != PacketType::EffectResult {
                return Err(ValidationError::FieldNotAllowed {
                    field: "timeRemaining",
                    kind,
                });
            }
            if remaining.is_zero() {
                return Err(ValidationError::NotPositive("timeRemaining"));
            }
        }

        Ok(Self { config })
    }

    /// Reply to a keep-alive request.
    pub fn keep_alive() -> Self {
        Self {
            config: ResponseConfig::new(PacketType::KeepAlive),
        }
    }

    /// Executor's password challenge.
    pub fn login() -> Self {
        Self {
            config: ResponseConfig::new(PacketType::Login),
        }
    }

    /// Executor's acknowledgement of a correct password.
    pub fn login_success() -> Self {
        Self {
            config: ResponseConfig::new(PacketType::LoginSuccess),
        }
    }

    /// Closing notice carrying a human-readable reason.
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self {
            config: ResponseConfig {
                message: Some(reason.into()),
                ..ResponseConfig::new(PacketType::Disconnect)
            },
        }
    }

    /// Copies the fields back out so a modified response can be constructed.
    pub fn to_config(&self) -> ResponseConfig {
        self.config.clone()
    }

    pub fn id(&self) -> u32 {
        self.config.id
    }

    pub fn packet_type(&self) -> PacketType {
        self.config.packet_type
    }

    pub fn result_type(&self) -> Option<ResultType> {
        self.config.result_type
    }

    pub fn message(&self) -> Option<&str> {
        self.config.message.as_deref()
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.config.time_remaining
    }

    pub fn effect(&self) -> Option<&str> {
        self.config.effect.as_deref()
    }

    /// Returns `true` if this response ends the series for its request id:
    /// a terminating result, or SUCCESS with no remaining time.
    pub fn is_terminating(&self) -> bool {
        match self.config.result_type {
            Some(ResultType::Success) => self.config.time_remaining.is_none(),
            Some(result) => result.is_terminating(),
            None => false,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
