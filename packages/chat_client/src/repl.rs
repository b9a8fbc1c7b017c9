use std::io::Write;

use anyhow::{Context, Result};
use convo_sync::InboundEvent;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ws_supervisor::{ConnectionStatus, Supervisor, WsTransport};

use crate::api::{ApiError, ChatApi};
use crate::config::ClientConfig;
use crate::render::Transcript;
use crate::session::{ChatSession, SessionView, new_session_id};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Cancel,
    Disconnect,
    Reconnect,
    NewSession,
    Status,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Input::Empty;
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return Input::Send(line.trim_end_matches(['\r', '\n']).to_string());
        };
        match command.to_lowercase().as_str() {
            "cancel" | "stop" => Input::Cancel,
            "disconnect" => Input::Disconnect,
            "reconnect" | "connect" => Input::Reconnect,
            "new" => Input::NewSession,
            "status" => Input::Status,
            "help" | "?" => Input::Help,
            "quit" | "exit" | "q" => Input::Quit,
            _ => Input::Unknown(trimmed.to_string()),
        }
    }
}

const HELP: &str = "\
commands:
  /cancel       stop the reply that is streaming
  /disconnect   close the connection (no automatic reconnect)
  /reconnect    connect again now
  /new          start a new session
  /status       show connection and session state
  /quit         exit
anything else is sent as a message";

fn spawn_supervisor(
    config: &ClientConfig,
    session_id: &str,
) -> Result<(Supervisor, mpsc::UnboundedReceiver<InboundEvent>)> {
    let (supervisor, events) = Supervisor::spawn(
        config.supervisor_config(session_id),
        WsTransport,
        config.reconnect_policy(),
    )
    .context("Failed to start connection supervisor")?;
    supervisor.connect()?;
    Ok((supervisor, events))
}

fn status_line(status: ConnectionStatus, view: &SessionView) -> String {
    let mut line = format!(
        "{status} | session {} | {} messages, {} pending",
        view.session_id,
        view.messages.len(),
        view.pending,
    );
    if view.is_loading {
        line.push_str(" | loading history");
    }
    if let Some(id) = &view.streaming_id {
        line.push_str(&format!(" | streaming {id}"));
    } else if view.is_sending {
        line.push_str(" | waiting for reply");
    }
    if let Some(error) = &view.last_error {
        line.push_str(&format!(" | last error: {error}"));
    }
    line
}

/// Run the interactive client until `/quit`, end of input or Ctrl-C.
pub async fn run(config: ClientConfig, session_id: Option<String>) -> Result<()> {
    let session_id = session_id.unwrap_or_else(new_session_id);
    let api = ChatApi::new(config.api_url.clone());
    let mut session = ChatSession::new(session_id.clone(), config.user_id.clone());
    let mut view = session.subscribe();
    let mut transcript = Transcript::default();
    let mut rendered_version = 0;

    let (mut supervisor, mut events) = spawn_supervisor(&config, &session_id)?;
    let mut status = supervisor.watch_status();
    info!(session_id = %session_id, url = %supervisor.url(), "chat session started");
    println!(
        "session {session_id} as {}  (/help for commands)",
        session.user_id()
    );

    // Send failures come back from background request tasks.
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<ApiError>();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    debug!("stdin closed");
                    break;
                };
                match Input::parse(&line) {
                    Input::Send(text) => match session.submit(&text) {
                        Some(outgoing) => {
                            let api = api.clone();
                            let failed_tx = failed_tx.clone();
                            let request = outgoing.request.clone();
                            tokio::spawn(async move {
                                if let Err(e) = api.send(&request).await {
                                    let _ = failed_tx.send(e);
                                }
                            });
                            session.show(&outgoing);
                        }
                        None if session.is_sending() => {
                            println!("(waiting for the current reply; /cancel to stop it)");
                        }
                        None => {}
                    },
                    Input::Cancel => match session.cancel_request() {
                        Some(request) => {
                            let api = api.clone();
                            tokio::spawn(async move {
                                if let Err(e) = api.cancel(&request).await {
                                    warn!(message_id = %request.message_id, error = %e, "cancel failed");
                                }
                            });
                        }
                        None => println!("(nothing is streaming)"),
                    },
                    Input::Disconnect => supervisor.disconnect()?,
                    Input::Reconnect => supervisor.reconnect()?,
                    Input::NewSession => {
                        let next_id = new_session_id();
                        let (next, next_events) = spawn_supervisor(&config, &next_id)?;
                        let previous = std::mem::replace(&mut supervisor, next);
                        previous.shutdown().await;
                        events = next_events;
                        status = supervisor.watch_status();
                        session.reset(next_id.clone());
                        transcript.reset();
                        rendered_version = 0;
                        info!(session_id = %next_id, "started new session");
                        println!("session {next_id}");
                    }
                    Input::Status => {
                        println!("{}", status_line(supervisor.status(), &view.borrow()));
                    }
                    Input::Help => println!("{HELP}"),
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Unknown(command) => println!("unknown command {command}, try /help"),
                }
            }
            Some(event) = events.recv() => {
                debug!(kind = event.kind(), "inbound event");
                if let InboundEvent::Error { error, .. } = &event {
                    println!("! {error}");
                }
                session.handle_event(event);
            }
            Ok(()) = status.changed() => {
                let current = *status.borrow_and_update();
                println!("[{current}]");
            }
            Ok(()) = view.changed() => {
                let snapshot = view.borrow_and_update().clone();
                if snapshot.version == rendered_version {
                    continue;
                }
                rendered_version = snapshot.version;
                let out = transcript.render(&snapshot.messages);
                if !out.is_empty() {
                    print!("{out}");
                    std::io::stdout().flush()?;
                }
            }
            Some(err) = failed_rx.recv() => {
                println!("! {}", err.user_message());
                session.send_failed(err);
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted");
                break;
            }
        }
    }

    supervisor.shutdown().await;
    info!("chat session ended");
    Ok(())
}
