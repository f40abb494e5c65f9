//! Connector message status and content type tags

use serde::{Deserialize, Serialize};

/// Processing state of a connector message (source or destination)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Source accepted the raw message
    Received,
    /// Rejected by a filter; no further processing
    Filtered,
    /// Transformer completed and encoded content exists
    Transformed,
    /// Transport acknowledged delivery
    Sent,
    /// Waiting in (or retrying from) the destination queue
    Queued,
    /// Processing or delivery failed permanently
    Error,
    /// Destination row created, not yet processed
    Pending,
}

impl Status {
    /// Single-character code used in the `status` column
    pub fn as_char(&self) -> char {
        match self {
            Status::Received => 'R',
            Status::Filtered => 'F',
            Status::Transformed => 'T',
            Status::Sent => 'S',
            Status::Queued => 'Q',
            Status::Error => 'E',
            Status::Pending => 'P',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'R' => Some(Status::Received),
            'F' => Some(Status::Filtered),
            'T' => Some(Status::Transformed),
            'S' => Some(Status::Sent),
            'Q' => Some(Status::Queued),
            'E' => Some(Status::Error),
            'P' => Some(Status::Pending),
            _ => None,
        }
    }

    /// Whether a chained destination may start once the previous one is here.
    /// Queued counts: the wait-for-previous contract gates on hand-off to the
    /// queue, not on eventual delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Sent | Status::Error | Status::Filtered | Status::Queued
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Received => "RECEIVED",
            Status::Filtered => "FILTERED",
            Status::Transformed => "TRANSFORMED",
            Status::Sent => "SENT",
            Status::Queued => "QUEUED",
            Status::Error => "ERROR",
            Status::Pending => "PENDING",
        };
        write!(f, "{}", name)
    }
}

/// Tag distinguishing the serialized forms kept per connector message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Raw,
    ProcessedRaw,
    Transformed,
    Encoded,
    Sent,
    Response,
    ResponseTransformed,
    ProcessingError,
    ResponseError,
    PostprocessorError,
    SourceMapContent,
    ChannelMapContent,
    ResponseMapContent,
}

impl ContentType {
    /// Stable numeric code used in the `content_type` column
    pub fn code(&self) -> i16 {
        match self {
            ContentType::Raw => 1,
            ContentType::ProcessedRaw => 2,
            ContentType::Transformed => 3,
            ContentType::Encoded => 4,
            ContentType::Sent => 5,
            ContentType::Response => 6,
            ContentType::ResponseTransformed => 7,
            ContentType::ProcessingError => 8,
            ContentType::ResponseError => 9,
            ContentType::PostprocessorError => 10,
            ContentType::SourceMapContent => 11,
            ContentType::ChannelMapContent => 12,
            ContentType::ResponseMapContent => 13,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(ContentType::Raw),
            2 => Some(ContentType::ProcessedRaw),
            3 => Some(ContentType::Transformed),
            4 => Some(ContentType::Encoded),
            5 => Some(ContentType::Sent),
            6 => Some(ContentType::Response),
            7 => Some(ContentType::ResponseTransformed),
            8 => Some(ContentType::ProcessingError),
            9 => Some(ContentType::ResponseError),
            10 => Some(ContentType::PostprocessorError),
            11 => Some(ContentType::SourceMapContent),
            12 => Some(ContentType::ChannelMapContent),
            13 => Some(ContentType::ResponseMapContent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_char_round_trip() {
        for status in [
            Status::Received,
            Status::Filtered,
            Status::Transformed,
            Status::Sent,
            Status::Queued,
            Status::Error,
            Status::Pending,
        ] {
            assert_eq!(Status::from_char(status.as_char()), Some(status));
        }
        assert_eq!(Status::from_char('X'), None);
    }

    #[test]
    fn queued_is_terminal_for_chaining() {
        assert!(Status::Queued.is_terminal());
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Transformed.is_terminal());
    }
}
