//! Line protocol spoken with the orchestrator.
//!
//! Every message is one `\n`-terminated line of space-separated tokens, verb
//! first. Arbitrary bytes (paths, file contents) travel base64-encoded so they
//! can never contain a separator.
//!
//! ```text
//! client → server   state <label> | name <name> | OS <os> <arch>
//! server → client   clearDirectory | directory <b64> | file <b64> <b64>
//!                   start | stop | filesDone | shutdown
//! ```

use std::fmt;

use base64::Engine;

/// Lifecycle label reported to the orchestrator. The labels are wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    WaitingForCommands,
    ClearingDirectory,
    TroubleClearingDirectory,
    LoadingFolders,
    LoadingFiles,
    Waiting,
    Running,
    Stopped,
    ShuttingDown,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::WaitingForCommands => "Waiting_for_commands",
            ClientState::ClearingDirectory => "Clearing_directory",
            ClientState::TroubleClearingDirectory => "Trouble_clearing_directory",
            ClientState::LoadingFolders => "Loading_folders",
            ClientState::LoadingFiles => "Loading_files",
            ClientState::Waiting => "Waiting",
            ClientState::Running => "Running",
            ClientState::Stopped => "Stopped",
            ClientState::ShuttingDown => "Shutting_down",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded orchestrator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ClearDirectory,
    /// Relative directory path, decoded.
    Directory(String),
    File {
        path: String,
        content: Vec<u8>,
    },
    Start,
    Stop,
    FilesDone,
    Shutdown,
}

impl Command {
    /// Wire verb of this command, for logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::ClearDirectory => "clearDirectory",
            Command::Directory(_) => "directory",
            Command::File { .. } => "file",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::FilesDone => "filesDone",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Why a line could not be turned into a [`Command`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not one of the known verbs. Skipped by the session.
    #[error("Unknown command {0:?}")]
    UnknownVerb(String),
    #[error("{verb}: missing argument <{argument}>")]
    MissingArgument {
        verb: &'static str,
        argument: &'static str,
    },
    #[error("{verb}: invalid base64 in <{argument}>: {source}")]
    Base64 {
        verb: &'static str,
        argument: &'static str,
        source: base64::DecodeError,
    },
    #[error("{verb}: <{argument}> is not valid UTF-8")]
    Utf8 {
        verb: &'static str,
        argument: &'static str,
    },
}

impl ProtocolError {
    /// Unknown verbs are forward-compatible noise; everything else means the
    /// orchestrator sent a broken command.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::UnknownVerb(_))
    }

    /// Verb of the offending line, when it was a known one.
    pub fn verb(&self) -> &'static str {
        match self {
            ProtocolError::UnknownVerb(_) => "unknown",
            ProtocolError::MissingArgument { verb, .. }
            | ProtocolError::Base64 { verb, .. }
            | ProtocolError::Utf8 { verb, .. } => *verb,
        }
    }
}

/// Strip the line terminator (`\n`, optionally preceded by `\r`).
pub fn trim_line(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Parse one line (terminator already stripped).
///
/// Tokens are split on single spaces, so `a  b` yields an empty middle token,
/// as the orchestrator never emits doubled separators. Extra trailing tokens
/// are ignored.
pub fn parse_line(line: &str) -> Result<Command, ProtocolError> {
    let mut tokens = line.split(' ');
    let verb = tokens.next().unwrap_or_default();

    match verb {
        "clearDirectory" => Ok(Command::ClearDirectory),
        "directory" => {
            let path = decode_utf8("directory", "path", tokens.next())?;
            Ok(Command::Directory(path))
        }
        "file" => {
            let path = decode_utf8("file", "path", tokens.next())?;
            let content = decode("file", "content", tokens.next())?;
            Ok(Command::File { path, content })
        }
        "start" => Ok(Command::Start),
        "stop" => Ok(Command::Stop),
        "filesDone" => Ok(Command::FilesDone),
        "shutdown" => Ok(Command::Shutdown),
        other => Err(ProtocolError::UnknownVerb(other.to_string())),
    }
}

fn decode(
    verb: &'static str,
    argument: &'static str,
    token: Option<&str>,
) -> Result<Vec<u8>, ProtocolError> {
    let token = token.ok_or(ProtocolError::MissingArgument { verb, argument })?;
    base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|source| ProtocolError::Base64 {
            verb,
            argument,
            source,
        })
}

fn decode_utf8(
    verb: &'static str,
    argument: &'static str,
    token: Option<&str>,
) -> Result<String, ProtocolError> {
    let bytes = decode(verb, argument, token)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::Utf8 { verb, argument })
}

/// Base64-encode bytes for the wire (the orchestrator side of [`parse_line`]).
pub fn encode_arg(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn state_line(state: ClientState) -> String {
    format!("state {state}\n")
}

pub fn name_line(name: &str) -> String {
    format!("name {name}\n")
}

/// `OS <os> <arch>` using the target the agent was built for.
pub fn platform_line() -> String {
    format!(
        "OS {} {}\n",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_labels() {
        assert_eq!(ClientState::WaitingForCommands.as_str(), "Waiting_for_commands");
        assert_eq!(
            ClientState::TroubleClearingDirectory.to_string(),
            "Trouble_clearing_directory"
        );
        assert_eq!(state_line(ClientState::Running), "state Running\n");
    }

    #[test]
    fn test_parse_bare_verbs() {
        assert_eq!(parse_line("clearDirectory").unwrap(), Command::ClearDirectory);
        assert_eq!(parse_line("start").unwrap(), Command::Start);
        assert_eq!(parse_line("stop").unwrap(), Command::Stop);
        assert_eq!(parse_line("filesDone").unwrap(), Command::FilesDone);
        assert_eq!(parse_line("shutdown").unwrap(), Command::Shutdown);
    }

    #[test]
    fn test_parse_directory() {
        let line = format!("directory {}", encode_arg(b"assets/textures"));
        assert_eq!(
            parse_line(&line).unwrap(),
            Command::Directory("assets/textures".to_string())
        );
    }

    #[test]
    fn test_parse_empty_directory() {
        assert_eq!(
            parse_line("directory ").unwrap(),
            Command::Directory(String::new())
        );
    }

    #[test]
    fn test_parse_file_with_binary_content() {
        let content = [0u8, 10, 32, 255, 13];
        let line = format!(
            "file {} {}",
            encode_arg("dir with space/a.bin".as_bytes()),
            encode_arg(&content)
        );
        let cmd = parse_line(&line).unwrap();
        assert_eq!(
            cmd,
            Command::File {
                path: "dir with space/a.bin".to_string(),
                content: content.to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_unknown_verb() {
        let err = parse_line("foo bar").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownVerb(ref v) if v == "foo"));
        assert!(err.is_recoverable());
        // Verbs are case-sensitive
        assert!(parse_line("Start").unwrap_err().is_recoverable());
        assert!(parse_line("").unwrap_err().is_recoverable());
    }

    #[test]
    fn test_parse_missing_argument() {
        let err = parse_line("file aGk=").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingArgument {
                verb: "file",
                argument: "content"
            }
        ));
        assert!(!err.is_recoverable());
        assert!(matches!(
            parse_line("directory").unwrap_err(),
            ProtocolError::MissingArgument { verb: "directory", .. }
        ));
    }

    #[test]
    fn test_parse_bad_base64() {
        let err = parse_line("directory !!!").unwrap_err();
        assert!(matches!(err, ProtocolError::Base64 { verb: "directory", .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_parse_non_utf8_path() {
        let line = format!("directory {}", encode_arg(&[0xff, 0xfe]));
        assert!(matches!(
            parse_line(&line).unwrap_err(),
            ProtocolError::Utf8 { verb: "directory", .. }
        ));
    }

    #[test]
    fn test_trim_line() {
        assert_eq!(trim_line("start\n"), "start");
        assert_eq!(trim_line("start\r\n"), "start");
        assert_eq!(trim_line("start"), "start");
    }

    #[test]
    fn test_platform_line() {
        let line = platform_line();
        assert!(line.starts_with("OS "));
        assert!(line.ends_with('\n'));
        assert_eq!(line.trim_end().split(' ').count(), 3);
    }
}
