//! Line commands for the interactive console.

use std::path::PathBuf;

use pairlink_network::Command;

pub const HELP: &str = "\
commands:
  peers                     list discovered peers
  connect <name>            pair with a discovered peer
  disconnect                drop the current pairing
  status                    show connection state
  restart                   restart discovery and transport
  preview <text>            send a live preview
  insert <text>             type text on the peer
  enter <text>              type text and press return
  submit | clear | paste | delete | select-all | copy | cut
  click on|off              toggle the pre-position click on the peer
  photos <file>...          send files as one batch
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Peers,
    Connect(String),
    Disconnect,
    Status,
    Restart,
    Send(Command),
    Photos(Vec<PathBuf>),
    Help,
    Quit,
}

/// Parse one input line. Empty lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let text = |usage: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("usage: {word} {usage}"))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match word {
        "peers" => ConsoleCommand::Peers,
        "connect" => ConsoleCommand::Connect(text("<name>")?),
        "disconnect" => ConsoleCommand::Disconnect,
        "status" => ConsoleCommand::Status,
        "restart" => ConsoleCommand::Restart,
        "preview" => ConsoleCommand::Send(Command::Preview {
            text: rest.to_string(),
        }),
        "insert" => ConsoleCommand::Send(Command::Insert {
            text: text("<text>")?,
        }),
        "enter" => ConsoleCommand::Send(Command::InsertAndSubmit {
            text: text("<text>")?,
        }),
        "submit" => ConsoleCommand::Send(Command::Submit),
        "clear" => ConsoleCommand::Send(Command::ClearField),
        "paste" => ConsoleCommand::Send(Command::Paste),
        "delete" => ConsoleCommand::Send(Command::DeleteChar),
        "select-all" => ConsoleCommand::Send(Command::SelectAll),
        "copy" => ConsoleCommand::Send(Command::Copy),
        "cut" => ConsoleCommand::Send(Command::Cut),
        "click" => {
            let enabled = match rest {
                "on" => true,
                "off" => false,
                _ => return Err("usage: click on|off".to_string()),
            };
            ConsoleCommand::Send(Command::SetPrePositionClick { enabled })
        }
        "photos" => {
            let paths: Vec<PathBuf> = rest.split_whitespace().map(PathBuf::from).collect();
            if paths.is_empty() {
                return Err("usage: photos <file>...".to_string());
            }
            ConsoleCommand::Photos(paths)
        }
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}' (try 'help')")),
    };
    Ok(Some(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_commands_keep_spacing() {
        assert_eq!(
            parse("insert hello  world").unwrap(),
            Some(ConsoleCommand::Send(Command::Insert {
                text: "hello  world".into()
            }))
        );
        assert_eq!(
            parse("  enter ok ").unwrap(),
            Some(ConsoleCommand::Send(Command::InsertAndSubmit { text: "ok".into() }))
        );
        assert_eq!(
            parse("preview").unwrap(),
            Some(ConsoleCommand::Send(Command::Preview { text: String::new() }))
        );
    }

    #[test]
    fn test_parse_connect_and_photos() {
        assert_eq!(
            parse("connect Studio Mac").unwrap(),
            Some(ConsoleCommand::Connect("Studio Mac".into()))
        );
        assert_eq!(
            parse("photos a.jpg b.jpg").unwrap(),
            Some(ConsoleCommand::Photos(vec!["a.jpg".into(), "b.jpg".into()]))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("connect").is_err());
        assert!(parse("photos").is_err());
        assert!(parse("click maybe").is_err());
        assert!(parse("teleport").unwrap_err().contains("unknown"));
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_click() {
        assert_eq!(
            parse("click off").unwrap(),
            Some(ConsoleCommand::Send(Command::SetPrePositionClick { enabled: false }))
        );
    }
}
