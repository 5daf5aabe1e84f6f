//! JSON-RPC message shapes and the protocol parameters the client sends.

use serde::Serialize;
use serde_json::{Value, json};
use url::Url;

use crate::types::FileChangeKind;

pub(crate) mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";

    pub const DID_OPEN: &str = "textDocument/didOpen";
    pub const DID_CHANGE: &str = "textDocument/didChange";
    pub const DID_SAVE: &str = "textDocument/didSave";
    pub const DID_CLOSE: &str = "textDocument/didClose";
    pub const DID_CHANGE_WATCHED_FILES: &str = "workspace/didChangeWatchedFiles";

    pub const LOG_MESSAGE: &str = "window/logMessage";
    pub const WORKSPACE_CONFIGURATION: &str = "workspace/configuration";
    pub const REGISTER_CAPABILITY: &str = "client/registerCapability";
    pub const UNREGISTER_CAPABILITY: &str = "client/unregisterCapability";
    pub const WORK_DONE_PROGRESS_CREATE: &str = "window/workDoneProgress/create";
}

const JSONRPC_VERSION: &str = "2.0";
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// A message read from the server, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: Value,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl Incoming {
    /// Classify a decoded message. Returns `None` for anything that is not a
    /// well-formed response, request or notification.
    pub fn parse(message: &Value) -> Option<Self> {
        let id = message.get("id");
        let method = message.get("method").and_then(Value::as_str);
        let is_response = message.get("result").is_some() || message.get("error").is_some();

        match (id, method) {
            (Some(id), None) if is_response => Some(Self::Response {
                id: id.as_u64()?,
                body: message.clone(),
            }),
            (Some(id), Some(method)) => Some(Self::Request {
                id: id.clone(),
                method: method.to_string(),
                params: message.get("params").cloned(),
            }),
            (None, Some(method)) => Some(Self::Notification {
                method: method.to_string(),
                params: message.get("params").cloned(),
            }),
            _ => None,
        }
    }
}

/// Severity carried by `window/logMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageType {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Log),
            _ => None,
        }
    }
}

pub(crate) fn initialize_params(root_uri: Option<&Url>) -> Value {
    let workspace_folders = root_uri.map(|uri| {
        json!([{
            "uri": uri.as_str(),
            "name": workspace_name(uri),
        }])
    });

    json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": root_uri.map(Url::as_str),
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                }
            },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "didChangeWatchedFiles": {
                    "dynamicRegistration": false
                }
            },
            "window": {
                "workDoneProgress": true
            }
        },
        "workspaceFolders": workspace_folders,
    })
}

fn workspace_name(uri: &Url) -> String {
    uri.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("workspace")
        .to_string()
}

pub(crate) fn did_open_params(uri: &Url, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri.as_str(),
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &Url, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri.as_str(),
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_save_params(uri: &Url) -> Value {
    json!({
        "textDocument": { "uri": uri.as_str() }
    })
}

pub(crate) fn did_close_params(uri: &Url) -> Value {
    json!({
        "textDocument": { "uri": uri.as_str() }
    })
}

pub(crate) fn did_change_watched_files_params(uri: &Url, kind: FileChangeKind) -> Value {
    json!({
        "changes": [{
            "uri": uri.as_str(),
            "type": kind.protocol_code()
        }]
    })
}

/// Build the reply to a server-initiated request.
///
/// Registration and progress requests are acknowledged, configuration
/// requests get one `null` per requested item, and everything else is
/// answered with "method not found" so the server never blocks waiting.
pub(crate) fn server_request_reply(id: Value, method: &str, params: Option<&Value>) -> Value {
    match method {
        method::WORKSPACE_CONFIGURATION => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let result = Value::Array(vec![Value::Null; items]);
            json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": id,
                "result": result,
            })
        }
        method::REGISTER_CAPABILITY
        | method::UNREGISTER_CAPABILITY
        | method::WORK_DONE_PROGRESS_CREATE => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": null,
        }),
        other => json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {other}"),
            }
        }),
    }
}
