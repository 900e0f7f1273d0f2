//! Console command parsing

use std::path::PathBuf;

use nrf_central::EndpointKey;

/// Command list shown by `help`
pub const HELP: &str = "\
commands:
  help                       show this list
  init                       initialise the dongle
  scan                       start scanning
  stop                       stop scanning
  select <addr>              lock a discovered peer
  connect                    connect to the target
  disconnect                 drop the link
  endpoint <label>           select an endpoint
  read [label]               read an endpoint
  write [label,] <hex..>     write an endpoint
  replay <file>              run a replay script
  status                     print the session snapshot
  reset                      reset the dongle
  q | quit                   quit";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Help,
    Init,
    Scan,
    Stop,
    Select(String),
    Connect,
    Disconnect,
    Endpoint(String),
    Read(Option<String>),
    Write {
        label: Option<String>,
        payload: String,
    },
    Replay(PathBuf),
    Status,
    Reset,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line; `Ok(None)` for a blank line
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "help" | "?" => ConsoleCommand::Help,
            "init" => ConsoleCommand::Init,
            "scan" => ConsoleCommand::Scan,
            "stop" => ConsoleCommand::Stop,
            "select" => ConsoleCommand::Select(required(rest, "select <addr>")?),
            "connect" => ConsoleCommand::Connect,
            "disconnect" => ConsoleCommand::Disconnect,
            "endpoint" => ConsoleCommand::Endpoint(required(rest, "endpoint <label>")?),
            "read" => ConsoleCommand::Read(Some(rest.to_string()).filter(|r| !r.is_empty())),
            "write" => parse_write(rest)?,
            "replay" => ConsoleCommand::Replay(PathBuf::from(required(rest, "replay <file>")?)),
            "status" => ConsoleCommand::Status,
            "reset" => ConsoleCommand::Reset,
            "q" | "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command '{}', try 'help'", other)),
        };
        Ok(Some(command))
    }
}

fn required(rest: &str, usage: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(format!("usage: {}", usage))
    } else {
        Ok(rest.to_string())
    }
}

/// `write <hex..>`, `write <label>, <hex..>` or `write <label> <hex..>`
///
/// Without a comma, a leading three-token report-reference label is tried
/// first, then a one-token handle label. A run of byte tokens alone is a
/// payload for the selected endpoint.
fn parse_write(rest: &str) -> Result<ConsoleCommand, String> {
    if rest.is_empty() {
        return Err("usage: write [label,] <hex..>".to_string());
    }

    if let Some((label, payload)) = rest.split_once(',') {
        return Ok(ConsoleCommand::Write {
            label: Some(label.trim().to_string()),
            payload: required(payload.trim(), "write <label>, <hex..>")?,
        });
    }

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    for width in [3, 1] {
        if tokens.len() <= width {
            continue;
        }
        // handles are written with four digits, payload bytes with two
        if tokens[width - 1].len() <= 2 {
            continue;
        }
        let label = tokens[..width].join(" ");
        if label.parse::<EndpointKey>().is_ok() {
            return Ok(ConsoleCommand::Write {
                label: Some(label),
                payload: tokens[width..].join(" "),
            });
        }
    }

    Ok(ConsoleCommand::Write {
        label: None,
        payload: rest.to_string(),
    })
}
