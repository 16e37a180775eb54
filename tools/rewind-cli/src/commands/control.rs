//! Line-oriented control commands read by `rewind run`.

use std::str::FromStr;

/// One command typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Save a clip, optionally overriding the window (milliseconds).
    Clip {
        pre_ms: Option<u64>,
        post_ms: Option<u64>,
    },
    /// Change the default window (milliseconds).
    Window { pre_ms: u64, post_ms: u64 },
    Start,
    /// Stop buffering, dropping the clip in progress on resume.
    Stop,
    /// Stop buffering and finish the clip in progress first.
    Flush,
    VoiceStart,
    VoiceStop,
    /// Clipboard text that may contain a link.
    Link(String),
    /// Set the foreground app and, optionally, its URL.
    Context {
        package: String,
        url: Option<String>,
    },
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  clip [PRE_MS POST_MS]   save a clip around now
  window PRE_MS POST_MS   change the default window
  start | stop | flush    enable, disable, or disable after finishing the clip
  voice start|stop        record a voice note for the current or last clip
  link TEXT               clipboard text; a link in it goes with the next clip
  context PKG [URL]       foreground app for the next clip
  status                  print engine status as JSON
  quit";

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (word.to_ascii_lowercase().as_str(), args.as_slice()) {
            ("clip" | "c", []) => Ok(Self::Clip {
                pre_ms: None,
                post_ms: None,
            }),
            ("clip" | "c", [pre, post]) => Ok(Self::Clip {
                pre_ms: Some(parse_ms(pre)?),
                post_ms: Some(parse_ms(post)?),
            }),
            ("clip" | "c", _) => Err("usage: clip [PRE_MS POST_MS]".to_string()),
            ("window", [pre, post]) => Ok(Self::Window {
                pre_ms: parse_ms(pre)?,
                post_ms: parse_ms(post)?,
            }),
            ("window", _) => Err("usage: window PRE_MS POST_MS".to_string()),
            ("start", []) => Ok(Self::Start),
            ("stop", []) => Ok(Self::Stop),
            ("flush", []) => Ok(Self::Flush),
            ("voice", ["start"]) => Ok(Self::VoiceStart),
            ("voice", ["stop"]) => Ok(Self::VoiceStop),
            ("voice", _) => Err("usage: voice start|stop".to_string()),
            ("link", _) if !rest.is_empty() => Ok(Self::Link(rest.to_string())),
            ("link", _) => Err("usage: link TEXT".to_string()),
            ("context", [package]) => Ok(Self::Context {
                package: package.to_string(),
                url: None,
            }),
            ("context", [package, url]) => Ok(Self::Context {
                package: package.to_string(),
                url: Some(url.to_string()),
            }),
            ("context", _) => Err("usage: context PKG [URL]".to_string()),
            ("status", []) => Ok(Self::Status),
            ("help" | "?", _) => Ok(Self::Help),
            ("quit" | "exit" | "q", []) => Ok(Self::Quit),
            ("", _) => Err("empty command".to_string()),
            (other, _) => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

fn parse_ms(value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|_| format!("'{value}' is not a duration in milliseconds"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_with_and_without_window() {
        assert_eq!(
            "clip".parse::<ControlCommand>(),
            Ok(ControlCommand::Clip {
                pre_ms: None,
                post_ms: None
            })
        );
        assert_eq!(
            "  clip 3000 2000 ".parse::<ControlCommand>(),
            Ok(ControlCommand::Clip {
                pre_ms: Some(3_000),
                post_ms: Some(2_000)
            })
        );
        assert!("clip 3000".parse::<ControlCommand>().is_err());
        assert!("clip soon later".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_window_needs_two_numbers() {
        assert_eq!(
            "window 1000 8000".parse::<ControlCommand>(),
            Ok(ControlCommand::Window {
                pre_ms: 1_000,
                post_ms: 8_000
            })
        );
        assert!("window 1000".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_lifecycle_and_voice() {
        assert_eq!("start".parse::<ControlCommand>(), Ok(ControlCommand::Start));
        assert_eq!("STOP".parse::<ControlCommand>(), Ok(ControlCommand::Stop));
        assert_eq!("flush".parse::<ControlCommand>(), Ok(ControlCommand::Flush));
        assert_eq!("voice start".parse::<ControlCommand>(), Ok(ControlCommand::VoiceStart));
        assert_eq!("voice stop".parse::<ControlCommand>(), Ok(ControlCommand::VoiceStop));
        assert!("voice pause".parse::<ControlCommand>().is_err());
        assert_eq!("quit".parse::<ControlCommand>(), Ok(ControlCommand::Quit));
        assert_eq!("status".parse::<ControlCommand>(), Ok(ControlCommand::Status));
    }

    #[test]
    fn test_link_keeps_the_whole_text() {
        assert_eq!(
            "link watch this https://example.com/v/1".parse::<ControlCommand>(),
            Ok(ControlCommand::Link("watch this https://example.com/v/1".into()))
        );
        assert!("link".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_context_with_optional_url() {
        assert_eq!(
            "context org.example.player".parse::<ControlCommand>(),
            Ok(ControlCommand::Context {
                package: "org.example.player".into(),
                url: None
            })
        );
        assert_eq!(
            "context org.example.player https://example.com".parse::<ControlCommand>(),
            Ok(ControlCommand::Context {
                package: "org.example.player".into(),
                url: Some("https://example.com".into())
            })
        );
    }

    #[test]
    fn test_unknown_and_empty_lines_are_errors() {
        assert!("".parse::<ControlCommand>().is_err());
        let err = "record".parse::<ControlCommand>().unwrap_err();
        assert!(err.contains("record"));
    }
}
