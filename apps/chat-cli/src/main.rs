mod config;
mod logging;
mod state;

use std::{process::ExitCode, sync::Arc};

use chat_core::{MessageId, PlainTextRenderer, SessionCommand};
use chat_runtime::{SessionHandle, spawn_session};
use chat_transport::{HttpChatApi, RealtimeConnector, WsConnector};
use config::CliConfig;
use state::ConsoleState;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{debug, error, info, warn};

const HELP: &str = "commands: /older  /delete <id>  /captcha <answer>  /clear  /quit";

/// Parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InputAction {
    Send(String),
    LoadOlder,
    Delete(MessageId),
    Captcha(String),
    ClearPending,
    Help,
    Quit,
    Invalid(String),
}

fn parse_input(line: &str) -> Option<InputAction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(InputAction::Send(line.to_owned()));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((command, ""));
    let action = match name {
        "older" => InputAction::LoadOlder,
        "delete" => match rest.parse::<u64>() {
            Ok(id) => InputAction::Delete(MessageId(id)),
            Err(_) => InputAction::Invalid(format!("not a message id: '{rest}'")),
        },
        "captcha" if !rest.is_empty() => InputAction::Captcha(rest.to_owned()),
        "captcha" => InputAction::Invalid("usage: /captcha <answer>".to_owned()),
        "clear" => InputAction::ClearPending,
        "help" => InputAction::Help,
        "quit" | "exit" => InputAction::Quit,
        // `//text` sends a message starting with a slash.
        _ if command.starts_with('/') => InputAction::Send(command.to_owned()),
        other => InputAction::Invalid(format!("unknown command /{other}")),
    };
    Some(action)
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting chat-cli");

    let config = match CliConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("chat-cli: {err}");
            return ExitCode::FAILURE;
        }
    };

    let handle = start_session(&config);
    run_console(&handle, ConsoleState::new(config.tuning.timeline_max_items)).await;

    if let Err(err) = handle.send(SessionCommand::Leave).await {
        debug!(error = %err, "session already stopped");
    }
    info!("chat-cli stopped");
    ExitCode::SUCCESS
}

fn start_session(config: &CliConfig) -> SessionHandle {
    let mut api = HttpChatApi::new(config.base_url.clone());
    if let Some(cookie) = &config.session_cookie {
        api = api.with_session_cookie(cookie.clone());
    }

    let connector: Option<Arc<dyn RealtimeConnector>> = match &config.ws_url {
        Some(url) => match WsConnector::new(url.clone()) {
            Ok(connector) => {
                let connector = match &config.session_cookie {
                    Some(cookie) => connector.with_session_cookie(cookie.clone()),
                    None => connector,
                };
                Some(Arc::new(connector))
            }
            Err(err) => {
                warn!(error = %err, "websocket url rejected, polling only");
                None
            }
        },
        None => None,
    };

    info!(
        room_id = config.room_id,
        live = connector.is_some(),
        "opening room session"
    );
    spawn_session(
        config.session_config(),
        connector,
        Arc::new(api),
        Arc::new(PlainTextRenderer),
    )
}

async fn run_console(handle: &SessionHandle, mut state: ConsoleState) {
    let mut events = handle.subscribe();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for line in state.handle_view_event(event) {
                        println!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console fell behind session events"),
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdin read failed");
                        break;
                    }
                };
                let Some(action) = parse_input(&line) else {
                    continue;
                };
                let command = match action {
                    InputAction::Send(content) => SessionCommand::SendMessage { content },
                    InputAction::LoadOlder => SessionCommand::LoadOlder,
                    InputAction::Delete(id) => SessionCommand::DeleteMessage { id },
                    InputAction::Captcha(answer) => {
                        let Some(captcha_id) = state.pending_captcha().map(str::to_owned) else {
                            println!("!! no captcha is pending");
                            continue;
                        };
                        state.clear_captcha();
                        SessionCommand::AnswerCaptcha { captcha_id, answer }
                    }
                    InputAction::ClearPending => SessionCommand::ClearPending,
                    InputAction::Help => {
                        println!("{HELP}");
                        continue;
                    }
                    InputAction::Quit => break,
                    InputAction::Invalid(reason) => {
                        println!("!! {reason}");
                        continue;
                    }
                };
                if handle.send(command).await.is_err() {
                    error!("session stopped unexpectedly");
                    break;
                }
            }
        }
    }
}
