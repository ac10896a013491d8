//! Line protocol spoken over the control socket.
//!
//! One request line per connection, answered by one response line:
//! `ok`, `ok <payload>` or `error <message>`. Tags are whitespace separated,
//! so tags containing spaces cannot be addressed.

use std::fmt;
use std::sync::Arc;

use crate::control::ControlHandler;
use crate::engine::EngineHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Reload,
    SelectOutbound {
        group_tag: String,
        outbound_tag: String,
    },
    UrlTest {
        group_tag: String,
    },
    ClearLogs,
    Status,
    SystemProxyStatus,
    SetSystemProxy(bool),
}

impl ControlRequest {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| "empty request".to_string())?;
        let args: Vec<&str> = words.collect();

        let request = match (verb, args.as_slice()) {
            ("reload", []) => Self::Reload,
            ("select_outbound", [group, outbound]) => Self::SelectOutbound {
                group_tag: group.to_string(),
                outbound_tag: outbound.to_string(),
            },
            ("url_test", [group]) => Self::UrlTest {
                group_tag: group.to_string(),
            },
            ("clear_logs", []) => Self::ClearLogs,
            ("status", []) => Self::Status,
            ("system_proxy", []) => Self::SystemProxyStatus,
            ("set_system_proxy", ["on"]) => Self::SetSystemProxy(true),
            ("set_system_proxy", ["off"]) => Self::SetSystemProxy(false),
            _ => return Err(format!("unrecognized request: {}", line.trim())),
        };
        Ok(request)
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reload => f.write_str("reload"),
            Self::SelectOutbound {
                group_tag,
                outbound_tag,
            } => write!(f, "select_outbound {group_tag} {outbound_tag}"),
            Self::UrlTest { group_tag } => write!(f, "url_test {group_tag}"),
            Self::ClearLogs => f.write_str("clear_logs"),
            Self::Status => f.write_str("status"),
            Self::SystemProxyStatus => f.write_str("system_proxy"),
            Self::SetSystemProxy(true) => f.write_str("set_system_proxy on"),
            Self::SetSystemProxy(false) => f.write_str("set_system_proxy off"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Ok(Option<String>),
    Error(String),
}

impl ControlResponse {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        match line.split_once(' ') {
            Some(("ok", payload)) => Self::Ok(Some(payload.to_string())),
            Some(("error", message)) => Self::Error(message.to_string()),
            None if line == "ok" => Self::Ok(None),
            _ => Self::Error(format!("malformed response: {line}")),
        }
    }
}

impl fmt::Display for ControlResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(None) => f.write_str("ok"),
            Self::Ok(Some(payload)) => write!(f, "ok {payload}"),
            Self::Error(message) => write!(f, "error {message}"),
        }
    }
}

/// Answers one request against the currently bound engine and the
/// lifecycle callbacks.
pub fn execute(
    request: &ControlRequest,
    service: Option<&Arc<dyn EngineHandle>>,
    handler: &dyn ControlHandler,
) -> ControlResponse {
    let not_running = || ControlResponse::Error("service not running".into());

    let result = match request {
        ControlRequest::SelectOutbound {
            group_tag,
            outbound_tag,
        } => match service {
            Some(service) => service.select_outbound(group_tag, outbound_tag),
            None => return not_running(),
        },
        ControlRequest::UrlTest { group_tag } => match service {
            Some(service) => service.url_test(group_tag),
            None => return not_running(),
        },
        ControlRequest::Reload => {
            handler.service_reload();
            Ok(())
        }
        ControlRequest::ClearLogs => {
            handler.clear_logs();
            Ok(())
        }
        ControlRequest::Status => {
            return ControlResponse::Ok(Some(handler.service_status().to_string()));
        }
        ControlRequest::SystemProxyStatus => {
            let status = handler.system_proxy_status();
            return ControlResponse::Ok(Some(format!(
                "available={} enabled={}",
                status.available, status.enabled
            )));
        }
        ControlRequest::SetSystemProxy(enabled) => {
            handler.set_system_proxy_enabled(*enabled);
            Ok(())
        }
    };

    match result {
        Ok(()) => ControlResponse::Ok(None),
        Err(e) => ControlResponse::Error(e.to_string()),
    }
}
