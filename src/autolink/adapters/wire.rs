use serde::{Deserialize, Serialize};

use crate::autolink::types::Outcome;

/// Role of the peer that sent an `attach` frame on its end of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// One newline-delimited JSON frame. The same vocabulary is used in both
/// directions; `handle` names a link within its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Frame {
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    Attach {
        handle: u64,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Detach {
        handle: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Flow {
        handle: u64,
        credit: i64,
    },
    Transfer {
        handle: u64,
        delivery: u64,
        body: String,
    },
    Disposition {
        handle: u64,
        delivery: u64,
        outcome: Outcome,
    },
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

pub fn parse_frame(line: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(line)
}

pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_string(frame)?;
    Ok(format!("{encoded}\n"))
}
