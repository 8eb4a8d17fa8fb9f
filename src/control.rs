//! Detector control-channel protocol.
//!
//! The streamer sits between a client and the detector's control server
//! (camserver) and relays bytes both ways. Two things are interpreted:
//!
//! - **Arm commands** from the client (`Exposure`, `ExtMtrigger`, `ExtEnable`,
//!   `Exttrigger`). The save path is replaced by `scan<N>.<ext>` so the
//!   streamer knows which files belong to the series.
//! - **Completion records** from camserver. Responses are terminated by
//!   `0x18`; a record starting with `7` reports a finished acquisition as
//!   `<code> <OK|ERR> <path>`.

use bytes::BytesMut;
use pilatus_core::ProtocolParseError;
use tracing::warn;

/// Response record terminator.
pub const RECORD_TERMINATOR: u8 = 0x18;

/// Largest partial response kept while waiting for a terminator.
pub const MAX_PENDING_RESPONSE: usize = 64 * 1024;

/// Commands that start an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmCommand {
    /// Internal trigger
    Exposure,
    /// External multi-trigger
    ExtMtrigger,
    /// External enable
    ExtEnable,
    /// External trigger
    ExtTrigger,
}

impl ArmCommand {
    const ALL: [ArmCommand; 4] = [
        ArmCommand::Exposure,
        ArmCommand::ExtMtrigger,
        ArmCommand::ExtEnable,
        ArmCommand::ExtTrigger,
    ];

    /// Verb as camserver spells it.
    #[must_use]
    pub fn verb(self) -> &'static str {
        match self {
            ArmCommand::Exposure => "Exposure",
            ArmCommand::ExtMtrigger => "ExtMtrigger",
            ArmCommand::ExtEnable => "ExtEnable",
            ArmCommand::ExtTrigger => "Exttrigger",
        }
    }

    /// Classify a raw client request by case-insensitive verb prefix.
    #[must_use]
    pub fn classify(request: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|command| {
            let verb = command.verb().as_bytes();
            request.len() >= verb.len() && request[..verb.len()].eq_ignore_ascii_case(verb)
        })
    }
}

/// A parsed arm request from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmRequest {
    /// Recognized command
    pub command: ArmCommand,
    /// Verb token exactly as the client sent it
    pub verb: String,
    /// Path the client asked camserver to save to
    pub save_path: Option<String>,
}

impl ArmRequest {
    /// Parse `request` if it is an arm command.
    #[must_use]
    pub fn parse(request: &[u8]) -> Option<Self> {
        let command = ArmCommand::classify(request)?;
        let text = String::from_utf8_lossy(request);
        let mut tokens = text
            .trim_end_matches('\0')
            .split_whitespace()
            .map(str::to_string);
        let verb = tokens.next()?;
        Some(Self {
            command,
            verb,
            save_path: tokens.next(),
        })
    }

    /// Command to forward, with the save path replaced by `filename`.
    ///
    /// NUL-terminated, as camserver expects.
    #[must_use]
    pub fn rewrite(&self, filename: &str) -> Vec<u8> {
        format!("{} {}\0", self.verb, filename).into_bytes()
    }
}

/// Outcome reported by a completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Acquisition finished and the last file was written
    Ok,
    /// Acquisition failed or was aborted
    Err,
}

/// A `7 <status> <path>` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Numeric response code (7)
    pub code: u32,
    /// Reported outcome
    pub status: CompletionStatus,
    /// Path of the last file written
    pub path: String,
}

impl CompletionRecord {
    /// Parse one record.
    ///
    /// Returns `Ok(None)` for records that are not completion records.
    pub fn parse(record: &str) -> Result<Option<Self>, ProtocolParseError> {
        let record = record.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if !record.starts_with('7') {
            return Ok(None);
        }

        let mut tokens = record.split_whitespace();
        let code = tokens
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| ProtocolParseError::new(record, "response code is not a number"))?;
        let status = match tokens.next() {
            Some(status) if status.starts_with("OK") => CompletionStatus::Ok,
            Some(_) => CompletionStatus::Err,
            None => return Err(ProtocolParseError::new(record, "missing status")),
        };
        let path = tokens
            .next()
            .ok_or_else(|| ProtocolParseError::new(record, "missing path"))?
            .to_string();

        Ok(Some(Self { code, status, path }))
    }

    /// Final path component of [`path`](Self::path).
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Reassembles `0x18`-terminated response records across reads.
#[derive(Debug, Default)]
pub struct ResponseFramer {
    pending: BytesMut,
}

impl ResponseFramer {
    /// New framer with no pending bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet terminated.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed received bytes and return every complete, non-empty record.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);

        let mut records = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == RECORD_TERMINATOR) {
            let record = self.pending.split_to(end + 1);
            Self::collect(&record[..end], &mut records);
        }

        if self.pending.len() > MAX_PENDING_RESPONSE {
            warn!(
                bytes = self.pending.len(),
                "Unterminated control response, interpreting as-is"
            );
            let record = self.pending.split();
            Self::collect(&record, &mut records);
        }
        records
    }

    fn collect(raw: &[u8], records: &mut Vec<String>) {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if !text.is_empty() {
            records.push(text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_verbs() {
        assert_eq!(ArmCommand::classify(b"Exposure /tmp/a.cbf"), Some(ArmCommand::Exposure));
        assert_eq!(ArmCommand::classify(b"exposure x"), Some(ArmCommand::Exposure));
        assert_eq!(ArmCommand::classify(b"EXTMTRIGGER x"), Some(ArmCommand::ExtMtrigger));
        assert_eq!(ArmCommand::classify(b"ExtEnable x"), Some(ArmCommand::ExtEnable));
        assert_eq!(ArmCommand::classify(b"exttrigger x"), Some(ArmCommand::ExtTrigger));
        assert_eq!(ArmCommand::classify(b"ExpTime 0.1"), None);
        assert_eq!(ArmCommand::classify(b"Expo"), None);
        assert_eq!(ArmCommand::classify(b"NImages 10"), None);
    }

    #[test]
    fn test_rewrite_keeps_client_verb() {
        let request = ArmRequest::parse(b"Exposure /tmp/foo.cbf").unwrap();
        assert_eq!(request.save_path.as_deref(), Some("/tmp/foo.cbf"));
        assert_eq!(request.rewrite("scan3.cbf"), b"Exposure scan3.cbf\0");

        let request = ArmRequest::parse(b"exttrigger\n").unwrap();
        assert_eq!(request.command, ArmCommand::ExtTrigger);
        assert_eq!(request.save_path, None);
        assert_eq!(request.rewrite("scan0.tif"), b"exttrigger scan0.tif\0");
    }

    #[test]
    fn test_parse_completion_records() {
        let record = CompletionRecord::parse("7 OK /ramdisk/data/scan2_00009.cbf")
            .unwrap()
            .unwrap();
        assert_eq!(record.code, 7);
        assert_eq!(record.status, CompletionStatus::Ok);
        assert_eq!(record.file_name(), "scan2_00009.cbf");

        let record = CompletionRecord::parse("7 ERR /ramdisk/scan2.cbf").unwrap().unwrap();
        assert_eq!(record.status, CompletionStatus::Err);

        let record = CompletionRecord::parse("7 OK scan2.cbf").unwrap().unwrap();
        assert_eq!(record.file_name(), "scan2.cbf");

        assert_eq!(CompletionRecord::parse("15 OK Exposure time set").unwrap(), None);
    }

    #[test]
    fn test_malformed_completion_records() {
        assert!(CompletionRecord::parse("7 OK").is_err());
        assert!(CompletionRecord::parse("7").is_err());
        assert!(CompletionRecord::parse("7x OK /a").is_err());
    }

    #[test]
    fn test_framer_splits_and_reassembles() {
        let mut framer = ResponseFramer::new();
        assert_eq!(
            framer.push(b"15 OK Exposure time set\x18\x187 ERR /d/s_00001.cbf\x18"),
            vec!["15 OK Exposure time set", "7 ERR /d/s_00001.cbf"]
        );

        assert!(framer.push(b"7 OK /d/s_0").is_empty());
        assert_eq!(framer.pending_len(), 11);
        assert_eq!(framer.push(b"0001.cbf\x18"), vec!["7 OK /d/s_00001.cbf"]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_framer_flushes_oversized_partial() {
        let mut framer = ResponseFramer::new();
        let junk = vec![b'a'; MAX_PENDING_RESPONSE + 1];
        let records = framer.push(&junk);
        assert_eq!(records.len(), 1);
        assert_eq!(framer.pending_len(), 0);
    }
}
