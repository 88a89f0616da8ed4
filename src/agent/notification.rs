//! Desktop-notification sequences in session output.
//!
//! Programs running inside a session can ask the terminal to raise a
//! notification. Two encodings are recognised:
//!
//! - **OSC 9**: `ESC ] 9 ; message BEL`
//! - **OSC 777**: `ESC ] 777 ; notify ; title ; body BEL`
//!
//! Both accept either BEL (0x07) or ST (`ESC \`) as terminator.

use serde::{Deserialize, Serialize};

/// A notification raised by a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotification {
    /// OSC 9 message.
    Osc9 {
        /// Message text.
        message: String,
    },
    /// OSC 777 notification with title and body.
    Osc777 {
        /// Notification title.
        title: String,
        /// Notification body.
        body: String,
    },
}

impl SessionNotification {
    /// Flattens the notification into a single line for outbound delivery.
    pub fn message(&self) -> String {
        match self {
            Self::Osc9 { message } => message.clone(),
            Self::Osc777 { title, body } if body.is_empty() => title.clone(),
            Self::Osc777 { title, body } if title.is_empty() => body.clone(),
            Self::Osc777 { title, body } => format!("{title}: {body}"),
        }
    }
}

/// Scans raw output for notification sequences.
///
/// OSC 9 payloads made only of digits and semicolons are ignored; they are
/// progress/state reports some terminals multiplex on the same code.
pub fn detect_notifications(data: &[u8]) -> Vec<SessionNotification> {
    let mut found = Vec::new();
    let mut i = 0;

    while i + 1 < data.len() {
        if data[i] != 0x1b || data[i + 1] != b']' {
            i += 1;
            continue;
        }

        let start = i + 2;
        let Some(end) = find_terminator(data, start) else {
            break;
        };
        let content = &data[start..end];

        if let Some(rest) = content.strip_prefix(b"9;") {
            let message = String::from_utf8_lossy(rest).to_string();
            let numeric = message.chars().all(|c| c.is_ascii_digit() || c == ';');
            if !message.is_empty() && !numeric {
                found.push(SessionNotification::Osc9 { message });
            }
        } else if let Some(rest) = content.strip_prefix(b"777;notify;") {
            let text = String::from_utf8_lossy(rest);
            let (title, body) = text.split_once(';').unwrap_or((&text, ""));
            if !title.is_empty() || !body.is_empty() {
                found.push(SessionNotification::Osc777 {
                    title: title.to_string(),
                    body: body.to_string(),
                });
            }
        }

        i = end + 1;
    }

    found
}

fn find_terminator(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len()).find(|&j| {
        data[j] == 0x07 || (data[j] == 0x1b && data.get(j + 1) == Some(&b'\\'))
    })
}
