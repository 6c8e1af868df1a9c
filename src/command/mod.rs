//! # Command Module
//!
//! Line protocol for remote control of the collector.
//!
//! A request is `COMMAND` or `COMMAND>>PARAMETER`. Each request maps to one
//! [`Command`] and only that command's handler runs.

pub mod server;

pub use server::CommandServer;

use tracing::debug;

use crate::orchestrator::Orchestrator;

/// Separator between a command and its parameter
pub const PARAMETER_SEPARATOR: &str = ">>";

/// Parameter requesting a sync pass on stop
pub const SYNC_FLAG: &str = "SYNC";

pub const INVALID_COMMAND: &str = "INVALID COMMAND";
pub const UNAVAILABLE: &str = "UNAVAILABLE";
pub const NO_DATA: &str = "NO DATA";
pub const NO_DTC: &str = "NO DTC";
pub const OK: &str = "OK";
pub const AUTHENTICATED: &str = "AUTHENTICATED";
pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION FAILED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Current value of an active parameter
    QueryCommand(String),
    QueryStatus(String),
    GetDtc,
    ClearDtc,
    RestartDataManager { sync: bool },
    StopDataManager { sync: bool },
    /// Names of the active parameters
    GetCommandList,
    /// Latest fix as JSON, or one field of it
    GetPosition(Option<String>),
}

impl Command {
    /// Parse one request line, `None` for anything unrecognized
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (name, parameter) = match line.split_once(PARAMETER_SEPARATOR) {
            Some((name, parameter)) => (name, Some(parameter.trim())),
            None => (line, None),
        };

        let sync_flag = |parameter: Option<&str>| match parameter {
            None => Some(false),
            Some(SYNC_FLAG) => Some(true),
            Some(_) => None,
        };

        match (name.trim(), parameter) {
            ("QUERY_COMMAND", Some(p)) if !p.is_empty() => Some(Command::QueryCommand(p.to_string())),
            ("QUERY_STATUS", Some(p)) if !p.is_empty() => Some(Command::QueryStatus(p.to_string())),
            ("GET_DTC", None) => Some(Command::GetDtc),
            ("CLEAR_DTC", None) => Some(Command::ClearDtc),
            ("RESTART_DATA_MANAGER", p) => sync_flag(p).map(|sync| Command::RestartDataManager { sync }),
            ("STOP_DATA_MANAGER", p) => sync_flag(p).map(|sync| Command::StopDataManager { sync }),
            ("GET_COMMAND_LIST", None) => Some(Command::GetCommandList),
            ("GET_POSITION", None) => Some(Command::GetPosition(None)),
            ("GET_POSITION", Some(p)) if !p.is_empty() => Some(Command::GetPosition(Some(p.to_string()))),
            _ => None,
        }
    }
}

/// Run `command` against the orchestrator and render the reply
pub async fn dispatch(orchestrator: &Orchestrator, command: Command) -> String {
    debug!("Dispatching {:?}", command);

    match command {
        Command::QueryCommand(name) => value_reply(orchestrator.query_parameter(&name).await),
        Command::QueryStatus(name) => value_reply(orchestrator.query_status(&name).await),
        Command::GetDtc => match orchestrator.read_fault_codes().await {
            Ok(codes) if codes.is_empty() => NO_DTC.to_string(),
            Ok(codes) => codes.join(","),
            Err(_) => UNAVAILABLE.to_string(),
        },
        Command::ClearDtc => match orchestrator.clear_fault_codes().await {
            Ok(()) => OK.to_string(),
            Err(_) => UNAVAILABLE.to_string(),
        },
        Command::RestartDataManager { sync } => {
            let trip_id = orchestrator.restart_session(sync).await;
            format!("{} {}", OK, trip_id)
        }
        Command::StopDataManager { sync } => {
            orchestrator.stop_session(sync).await;
            OK.to_string()
        }
        Command::GetCommandList => {
            let names = orchestrator.active_parameters();
            if names.is_empty() {
                UNAVAILABLE.to_string()
            } else {
                names.join(",")
            }
        }
        Command::GetPosition(None) => orchestrator
            .position()
            .and_then(|fix| serde_json::to_string(&fix).ok())
            .unwrap_or_else(|| UNAVAILABLE.to_string()),
        Command::GetPosition(Some(name)) => orchestrator
            .position_label(&name)
            .map(|value| value.to_string())
            .unwrap_or_else(|| UNAVAILABLE.to_string()),
    }
}

fn value_reply(result: crate::error::Result<Option<String>>) -> String {
    match result {
        Ok(Some(value)) => value,
        Ok(None) => NO_DATA.to_string(),
        Err(e) => {
            debug!("Query unavailable: {}", e);
            UNAVAILABLE.to_string()
        }
    }
}
