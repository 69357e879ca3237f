//! Drives a MurmurCore from tokio: receive, heartbeat, retry and console loops all funnel
//! their actions through [`Host::apply`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use murmur_core::wire::MAX_DATAGRAM_LEN;
use murmur_core::{Action, Direction, Event, MurmurCore, PeerId, SendError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::command::{self, Command, HELP};
use crate::transport::Transport;

/// How often due retransmissions are collected.
pub const RETRY_POLL: Duration = Duration::from_millis(50);

pub struct Host {
    pub core: Arc<MurmurCore>,
    pub transport: Arc<Transport>,
    download_dir: PathBuf,
}

impl Host {
    pub fn new(core: Arc<MurmurCore>, transport: Arc<Transport>, download_dir: PathBuf) -> Self {
        Self {
            core,
            transport,
            download_dir,
        }
    }

    /// Execute core output: datagrams go to the group, events to the console.
    pub async fn apply(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(datagram) => {
                    if let Err(e) = self.transport.send(&datagram).await {
                        warn!(error = %e, len = datagram.len(), "send failed");
                    }
                }
                Action::Notify(event) => self.on_event(event).await,
            }
        }
    }

    async fn on_event(&self, event: Event) {
        if let Event::FileReceived {
            peer,
            file_id,
            name,
            data,
        } = &event
        {
            let path = received_file_path(&self.download_dir, *peer, *file_id, name);
            match save_file(&path, data).await {
                Ok(()) => println!("* saved {} ({} bytes) from {peer}", path.display(), data.len()),
                Err(e) => warn!(error = %e, path = %path.display(), "could not save file"),
            }
            return;
        }
        if let Some(line) = render_event(&event) {
            println!("{line}");
        }
    }

    async fn execute(&self, cmd: Command) -> anyhow::Result<()> {
        let now = Instant::now();
        let actions = match cmd {
            Command::Send { peer, text } => self.core.send_text(peer, &text, now)?,
            Command::Global { text } => self.core.send_global_text(&text)?,
            Command::SendFile { peer, path } => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_string());
                self.core.send_file_bytes(peer, &name, &data, now)?
            }
            Command::Peers => {
                let peers = self.core.known_peers();
                if peers.is_empty() {
                    println!("* nobody else here yet");
                }
                for p in peers {
                    let lock = if p.has_secret { "secure" } else { "pending" };
                    println!("* {} {} level {} [{lock}]", p.id, p.name, p.level);
                }
                Vec::new()
            }
            Command::History { peer } => {
                for entry in self.core.chat_history(peer) {
                    let (arrow, mark) = match entry.direction {
                        Direction::Outgoing if entry.delivered => ("->", ""),
                        Direction::Outgoing => ("->", " (unconfirmed)"),
                        Direction::Incoming => ("<-", ""),
                    };
                    println!("{arrow} {peer}: {}{mark}", entry.text);
                }
                Vec::new()
            }
            Command::Help => {
                println!("{HELP}");
                Vec::new()
            }
            Command::Quit => {
                self.transport.close();
                Vec::new()
            }
        };
        self.apply(actions).await;
        Ok(())
    }
}

/// One console line per user-visible event.
pub fn render_event(event: &Event) -> Option<String> {
    let line = match event {
        Event::PeerDiscovered { peer, name } => format!("* {name} ({peer}) joined"),
        Event::PeerExpired { peer } => format!("* {peer} left"),
        Event::SecretEstablished { peer } => format!("* secure channel with {peer} ready"),
        Event::MessageReceived { peer, text, .. } => format!("[{peer}] {text}"),
        Event::GlobalMessageReceived { peer, text } => format!("<{peer}> {text}"),
        Event::MessageDelivered { .. } => return None,
        Event::MessageDeliveryFailed { peer, message_id } => {
            format!("! message {message_id} to {peer} was not delivered")
        }
        Event::FileTransferProgress {
            peer,
            file_id,
            direction,
            transferred,
            total,
        } => {
            let pct = if *total == 0 { 100 } else { transferred * 100 / total };
            let way = match direction {
                Direction::Outgoing => "to",
                Direction::Incoming => "from",
            };
            format!("* file {file_id} {way} {peer}: {pct}%")
        }
        Event::FileTransferComplete {
            peer,
            file_id,
            direction: Direction::Outgoing,
        } => format!("* file {file_id} delivered to {peer}"),
        Event::FileTransferComplete { .. } => return None,
        Event::FileReceived { peer, name, data, .. } => {
            format!("* received {name} ({} bytes) from {peer}", data.len())
        }
    };
    Some(line)
}

/// Destination for a received file. Only the final path component of the sender's name is
/// used, prefixed so files from different senders never collide.
pub fn received_file_path(dir: &Path, peer: PeerId, file_id: u8, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "file".to_string());
    dir.join(format!("{}-{file_id}-{base}", peer.get()))
}

async fn save_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

pub async fn recv_loop(host: Arc<Host>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        match host.transport.recv(&mut buf).await {
            Ok(Some(n)) => {
                let actions = host.core.on_datagram(&buf[..n], Instant::now());
                host.apply(actions).await;
            }
            Ok(None) => break,
            Err(e) => warn!(error = %e, "receive failed"),
        }
    }
    debug!("receive loop stopped");
}

pub async fn heartbeat_loop(host: Arc<Host>, period: Duration) {
    let mut shutdown = host.transport.subscribe();
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => host.apply(host.core.heartbeat(Instant::now())).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("heartbeat loop stopped");
}

pub async fn retry_loop(host: Arc<Host>) {
    let mut shutdown = host.transport.subscribe();
    let mut ticker = tokio::time::interval(RETRY_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => host.apply(host.core.poll_retries(Instant::now())).await,
            _ = shutdown.changed() => break,
        }
    }
    debug!("retry loop stopped");
}

/// Read commands from stdin until EOF or /quit; both close the transport.
pub async fn command_loop(host: Arc<Host>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !host.transport.is_closed() {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin failed");
                break;
            }
        };
        match command::parse(&line) {
            Ok(Some(cmd)) => {
                if let Err(e) = host.execute(cmd).await {
                    match e.downcast_ref::<SendError>() {
                        Some(SendError::NoSharedSecret(_)) => {
                            println!("! {e}, try again in a moment")
                        }
                        _ => println!("! {e:#}"),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => println!("! {e}"),
        }
    }
    info!("console closed");
    host.transport.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_files_stay_inside_download_dir() {
        let dir = Path::new("/srv/in");
        assert_eq!(
            received_file_path(dir, PeerId(4), 2, "../../etc/passwd"),
            PathBuf::from("/srv/in/4-2-passwd")
        );
        assert_eq!(
            received_file_path(dir, PeerId(4), 3, ""),
            PathBuf::from("/srv/in/4-3-file")
        );
        assert_eq!(
            received_file_path(dir, PeerId(4), 3, ".."),
            PathBuf::from("/srv/in/4-3-file")
        );
    }

    #[test]
    fn progress_rendered_as_percentage() {
        let line = render_event(&Event::FileTransferProgress {
            peer: PeerId(2),
            file_id: 1,
            direction: Direction::Incoming,
            transferred: 50,
            total: 200,
        });
        assert_eq!(line.as_deref(), Some("* file 1 from #2: 25%"));
    }

    #[test]
    fn quiet_events_produce_no_line() {
        assert!(render_event(&Event::MessageDelivered {
            peer: PeerId(2),
            message_id: 0
        })
        .is_none());
        assert_eq!(
            render_event(&Event::MessageReceived {
                peer: PeerId(2),
                message_id: 0,
                text: "hey".into()
            })
            .as_deref(),
            Some("[#2] hey")
        );
    }

    #[tokio::test]
    async fn saved_file_lands_on_disk() {
        let dir = std::env::temp_dir().join(format!("murmur-host-test-{}", std::process::id()));
        let path = received_file_path(&dir, PeerId(1), 0, "a.txt");
        save_file(&path, b"contents").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"contents");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
