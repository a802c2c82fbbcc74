//! Classification of raw transport completions.

use relay_protocol::{ErrorPayload, ResponseEnvelope, ServerEvent, TransportResponse};

use crate::config::Mode;

const GUARD_PREFIX: &str = "while(1);";
const ERROR_TRAILER: &str = "/*ERROR*/";
const GENERIC_MESSAGE: &str = "Communication error, please retry or reload the page";
const EXCEPTION_MESSAGE: &str = "Received exception event from server";

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Success(ResponseEnvelope),
    /// The round trip did not complete; nothing is known about the server side.
    Incomplete,
    Error {
        /// Message delivered to the actions.
        message: String,
        /// Full diagnostic, logged regardless of mode.
        detail: String,
        /// Event the server asked to fire alongside the failure.
        exception: Option<ServerEvent>,
    },
}

/// `None` stands for a transport failure or a timeout.
pub fn decode(response: Option<&TransportResponse>, mode: Mode) -> Decoded {
    let Some(response) = response else {
        return Decoded::Incomplete;
    };
    if response.status == 0 || (12000..13000).contains(&response.status) {
        return Decoded::Incomplete;
    }

    let text = response.body.as_str();
    if text.trim_start().starts_with('<') {
        return malformed(text, mode);
    }

    let trimmed = text.trim_end();
    if response.status != 200 || trimmed.ends_with(ERROR_TRAILER) {
        return decode_error(trimmed, response.status, mode);
    }

    match serde_json::from_str::<ResponseEnvelope>(strip_guard(trimmed)) {
        Ok(envelope) => Decoded::Success(envelope),
        Err(_) => malformed(text, mode),
    }
}

fn strip_guard(text: &str) -> &str {
    let text = text.trim_start();
    text.strip_prefix(GUARD_PREFIX).unwrap_or(text)
}

fn decode_error(text: &str, status: u16, mode: Mode) -> Decoded {
    let body = strip_guard(text.strip_suffix(ERROR_TRAILER).unwrap_or(text));
    let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) else {
        return malformed(text, mode);
    };

    if payload.exception_event {
        return Decoded::Error {
            message: EXCEPTION_MESSAGE.to_owned(),
            detail: format!("{EXCEPTION_MESSAGE} (status {status})"),
            exception: payload.event,
        };
    }

    let mut detail = payload
        .message
        .unwrap_or_else(|| format!("Server returned status {status}"));
    if let Some(stack) = payload.stack {
        detail = format!("{detail}\n{stack}");
    }
    let message = match mode {
        Mode::Development => detail.clone(),
        Mode::Production => GENERIC_MESSAGE.to_owned(),
    };
    Decoded::Error {
        message,
        detail,
        exception: None,
    }
}

fn malformed(text: &str, mode: Mode) -> Decoded {
    let detail = format!("Communication error, invalid JSON: {text}");
    let message = match mode {
        Mode::Development => detail.clone(),
        Mode::Production => GENERIC_MESSAGE.to_owned(),
    };
    Decoded::Error {
        message,
        detail,
        exception: None,
    }
}
