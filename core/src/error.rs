use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("Invalid roll payload: {0}")]
    InvalidRollPayload(String),

    #[error("Invalid roll die id: {0}")]
    InvalidRollDieId(String),

    #[error("Die sides contradict die id: {0}")]
    RollDieSidesMismatch(String),

    #[error("No selected dice")]
    MissingSelectedDice,

    #[error("Selected die not in last roll: {0}")]
    SelectedDieNotRolled(String),

    #[error("Duplicated selected die: {0}")]
    DuplicatedSelectedDie(String),

    #[error("Score points mismatch, expected: {expected}")]
    ScorePointsMismatch { expected: u64 },

    #[error("Score references a stale roll")]
    ScoreRollMismatch,

    #[error("Room code already taken")]
    RoomCodeTaken,

    #[error("Room is full: {0}")]
    RoomFull(u32),

    #[error("Room not found")]
    RoomNotFound,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Session expired")]
    SessionExpired,

    #[error("Player not in session: {0}")]
    PlayerNotInSession(String),

    #[error("Not the active player")]
    NotYourTurn,

    #[error("Turn state not initialized")]
    TurnNotStarted,

    #[error("Wrong turn phase, expected: {0}")]
    TurnPhaseMismatch(String),

    #[error("Missing bearer token")]
    MissingBearer,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden")]
    Forbidden,

    #[error("Display name already taken")]
    DisplayNameTaken,

    #[error("Identity verification unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Identity verification rejected: {0}")]
    IdentityRejected(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Error in storage interaction: {0}")]
    StorageError(String),

    #[error("JSON parse error")]
    JsonParseError,

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl Error {
    /// Stable reason code carried in error responses and `error` frames.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidRollPayload(_) => "invalid_roll_payload",
            Error::InvalidRollDieId(_) => "invalid_roll_die_id",
            Error::RollDieSidesMismatch(_) => "roll_die_sides_mismatch",
            Error::MissingSelectedDice => "missing_selected_dice",
            Error::SelectedDieNotRolled(_) => "selected_die_not_rolled",
            Error::DuplicatedSelectedDie(_) => "duplicated_selected_die",
            Error::ScorePointsMismatch { .. } => "score_points_mismatch",
            Error::ScoreRollMismatch => "score_roll_mismatch",
            Error::RoomCodeTaken => "room_code_taken",
            Error::RoomFull(_) => "room_full",
            Error::RoomNotFound => "room_not_found",
            Error::SessionNotFound => "session_not_found",
            Error::SessionExpired => "session_expired",
            Error::PlayerNotInSession(_) => "player_not_in_session",
            Error::NotYourTurn => "not_your_turn",
            Error::TurnNotStarted => "turn_not_started",
            Error::TurnPhaseMismatch(_) => "turn_phase_mismatch",
            Error::MissingBearer => "missing_bearer",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden => "forbidden",
            Error::DisplayNameTaken => "display_name_taken",
            Error::IdentityUnavailable(_) => "identity_unavailable",
            Error::IdentityRejected(_) => "identity_rejected",
            Error::InvalidParams(_) => "invalid_params",
            Error::PayloadTooLarge => "payload_too_large",
            Error::MalformedMessage(_) => "malformed_message",
            Error::StorageError(_) => "storage_error",
            Error::JsonParseError => "json_parse_error",
            Error::IoError(_) => "io_error",
            Error::InternalError(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Error::JsonParseError
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
