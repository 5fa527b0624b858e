//! Line protocol spoken by the servo daemon
//!
//! One UTF-8 command per line on the daemon's stdin, tagged with a
//! sequence id for response correlation:
//!
//! ```text
//! SEQ:7 SET 0 135      -> SEQ:7 OK channel=0 angle=135.0 pulse=301
//! SEQ:8 OFF 1          -> SEQ:8 OK channel=1 off
//! ```
//!
//! The daemon emits a bare `READY` once after hardware init. Anything
//! else unsolicited is ignored by the link.

/// Commands understood by the servo daemon
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoCommand {
    /// Move the servo on `channel` to `angle` degrees
    Set { channel: u8, angle: i64 },
    /// Disable PWM on `channel` (servo relaxes)
    Off { channel: u8 },
    /// Disable PWM on all channels
    OffAll,
}

/// Daemon reply payloads, already stripped of the correlation tag
#[derive(Debug, Clone, PartialEq)]
pub enum ServoReply {
    Ok(String),
    Err(String),
}

/// One parsed daemon stdout line
#[derive(Debug, Clone, PartialEq)]
pub enum ServoLine {
    /// Bare readiness signal, once per daemon lifetime
    Ready,
    /// Correlated reply
    Reply { seq: u64, reply: ServoReply },
    /// Unrecognized / stray output
    Other(String),
}

/// Encode a command with its correlation tag (no trailing newline)
pub fn encode_command(seq: u64, command: &ServoCommand) -> String {
    match command {
        ServoCommand::Set { channel, angle } => {
            format!("SEQ:{} SET {} {}", seq, channel, angle)
        }
        ServoCommand::Off { channel } => format!("SEQ:{} OFF {}", seq, channel),
        ServoCommand::OffAll => format!("SEQ:{} OFF ALL", seq),
    }
}

/// Parse one daemon stdout line
pub fn parse_line(line: &str) -> ServoLine {
    let line = line.trim();
    if line == "READY" {
        return ServoLine::Ready;
    }

    let Some(rest) = line.strip_prefix("SEQ:") else {
        return ServoLine::Other(line.to_string());
    };

    let mut parts = rest.splitn(3, ' ');
    let Some(seq) = parts.next().and_then(|s| s.parse::<u64>().ok()) else {
        return ServoLine::Other(line.to_string());
    };
    let status = parts.next().unwrap_or("");
    let payload = parts.next().unwrap_or("").to_string();

    match status {
        "OK" | "BYE" => ServoLine::Reply {
            seq,
            reply: ServoReply::Ok(payload),
        },
        "ERR" => ServoLine::Reply {
            seq,
            reply: ServoReply::Err(payload),
        },
        _ => ServoLine::Other(line.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_set() {
        let cmd = ServoCommand::Set {
            channel: 0,
            angle: 135,
        };
        assert_eq!(encode_command(7, &cmd), "SEQ:7 SET 0 135");
    }

    #[test]
    fn test_encode_off() {
        assert_eq!(
            encode_command(8, &ServoCommand::Off { channel: 1 }),
            "SEQ:8 OFF 1"
        );
        assert_eq!(encode_command(9, &ServoCommand::OffAll), "SEQ:9 OFF ALL");
    }

    #[test]
    fn test_parse_ready() {
        assert_eq!(parse_line("READY\n"), ServoLine::Ready);
    }

    #[test]
    fn test_parse_ok_reply() {
        assert_eq!(
            parse_line("SEQ:7 OK channel=0 angle=135.0 pulse=301"),
            ServoLine::Reply {
                seq: 7,
                reply: ServoReply::Ok("channel=0 angle=135.0 pulse=301".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_err_reply() {
        assert_eq!(
            parse_line("SEQ:3 ERR unknown command: FOO"),
            ServoLine::Reply {
                seq: 3,
                reply: ServoReply::Err("unknown command: FOO".to_string()),
            }
        );
    }

    #[test]
    fn test_stray_lines_are_other() {
        assert!(matches!(parse_line("garbage"), ServoLine::Other(_)));
        assert!(matches!(parse_line("SEQ:x OK"), ServoLine::Other(_)));
        assert!(matches!(parse_line("SEQ:5 WAT hi"), ServoLine::Other(_)));
    }
}
