//! Console commands read line by line from stdin.

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use murmur_core::PeerId;

pub const HELP: &str = "\
/msg <peer> <text>   private encrypted message
/all <text>          message to everyone (plain text also works)
/file <peer> <path>  send a file
/peers               list known peers
/history <peer>      private chat history with a peer
/quit                leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { peer: PeerId, text: String },
    Global { text: String },
    SendFile { peer: PeerId, path: PathBuf },
    Peers,
    History { peer: PeerId },
    Help,
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Command::Global {
            text: line.to_string(),
        }));
    };
    let (word, rest) = split_word(body);
    let cmd = match word {
        "msg" => {
            let (peer, text) = split_word(rest);
            if text.is_empty() {
                bail!("usage: /msg <peer> <text>");
            }
            Command::Send {
                peer: parse_peer(peer)?,
                text: text.to_string(),
            }
        }
        "all" => {
            if rest.is_empty() {
                bail!("usage: /all <text>");
            }
            Command::Global {
                text: rest.to_string(),
            }
        }
        "file" => {
            let (peer, path) = split_word(rest);
            if path.is_empty() {
                bail!("usage: /file <peer> <path>");
            }
            Command::SendFile {
                peer: parse_peer(peer)?,
                path: PathBuf::from(path),
            }
        }
        "peers" => Command::Peers,
        "history" => Command::History {
            peer: parse_peer(rest)?,
        },
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{other}, try /help"),
    };
    Ok(Some(cmd))
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

/// Accepts `7` or `#7`.
fn parse_peer(s: &str) -> anyhow::Result<PeerId> {
    let digits = s.strip_prefix('#').unwrap_or(s);
    digits
        .parse::<u16>()
        .map(PeerId)
        .map_err(|_| anyhow!("not a peer id: {s:?}"))
}
