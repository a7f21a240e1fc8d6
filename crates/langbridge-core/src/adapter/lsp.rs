//! Language Server Protocol adapter
//!
//! Agents use 1-based lines and columns and plain file paths; LSP uses
//! 0-based positions and `file://` URIs. All conversion happens here.

use super::{CapabilitySet, DocumentRef, NativeReply, NativeRequest, native_error};
use crate::config::BackendDescriptor;
use crate::diagnostics::{DiagnosticEvent, DiagnosticUpdate, Severity};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Notification, Request, RequestId, RpcError};
use crate::types::Location;
use crate::workspace::BackendKey;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::trace;
use url::Url;

/// One agent tool served by LSP backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: &'static str,
    pub method: &'static str,
    /// Server capability that must be advertised
    pub provider: &'static str,
    pub description: &'static str,
    anchor: Anchor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Position,
    File,
    Query,
}

/// Tools the LSP adapter maps
pub const LSP_TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "hover",
        method: "textDocument/hover",
        provider: "hoverProvider",
        description: "Type and documentation at a position (file, line, column)",
        anchor: Anchor::Position,
    },
    ToolSpec {
        name: "definition",
        method: "textDocument/definition",
        provider: "definitionProvider",
        description: "Definition locations of the symbol at a position",
        anchor: Anchor::Position,
    },
    ToolSpec {
        name: "references",
        method: "textDocument/references",
        provider: "referencesProvider",
        description: "Reference locations of the symbol at a position",
        anchor: Anchor::Position,
    },
    ToolSpec {
        name: "document_symbols",
        method: "textDocument/documentSymbol",
        provider: "documentSymbolProvider",
        description: "Symbols declared in a file",
        anchor: Anchor::File,
    },
    ToolSpec {
        name: "workspace_symbols",
        method: "workspace/symbol",
        provider: "workspaceSymbolProvider",
        description: "Symbols matching a query across the workspace",
        anchor: Anchor::Query,
    },
    ToolSpec {
        name: "completion",
        method: "textDocument/completion",
        provider: "completionProvider",
        description: "Completion candidates at a position",
        anchor: Anchor::Position,
    },
];

const SYMBOL_KINDS: [&str; 26] = [
    "file",
    "module",
    "namespace",
    "package",
    "class",
    "method",
    "property",
    "field",
    "constructor",
    "enum",
    "interface",
    "function",
    "variable",
    "constant",
    "string",
    "number",
    "boolean",
    "array",
    "object",
    "key",
    "null",
    "enum_member",
    "struct",
    "event",
    "operator",
    "type_parameter",
];

const COMPLETION_KINDS: [&str; 25] = [
    "text",
    "method",
    "function",
    "constructor",
    "field",
    "variable",
    "class",
    "interface",
    "module",
    "property",
    "unit",
    "value",
    "enum",
    "keyword",
    "snippet",
    "color",
    "file",
    "reference",
    "folder",
    "enum_member",
    "constant",
    "struct",
    "event",
    "operator",
    "type_parameter",
];

fn tool_spec(tool: &str) -> Option<&'static ToolSpec> {
    LSP_TOOLS.iter().find(|spec| spec.name == tool)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LspAdapter;

impl LspAdapter {
    pub fn precheck(
        &self,
        tool: &str,
        arguments: &Value,
        descriptor: &BackendDescriptor,
    ) -> BridgeResult<()> {
        let spec = tool_spec(tool).ok_or_else(|| {
            BridgeError::unsupported(tool, "no mapping for language server backends")
        })?;
        if !descriptor.allows(tool) {
            return Err(BridgeError::unsupported(
                tool,
                format!("not enabled for backend {}", descriptor.key()),
            ));
        }
        match spec.anchor {
            Anchor::Position => {
                file_arg(tool, arguments)?;
                position_arg(tool, arguments)?;
            }
            Anchor::File => {
                file_arg(tool, arguments)?;
            }
            Anchor::Query => {
                query_arg(arguments)?;
            }
        }
        Ok(())
    }

    pub fn translate_request(
        &self,
        tool: &str,
        arguments: &Value,
        capabilities: &CapabilitySet,
        descriptor: &BackendDescriptor,
    ) -> BridgeResult<NativeRequest> {
        self.precheck(tool, arguments, descriptor)?;
        let spec = tool_spec(tool)
            .ok_or_else(|| BridgeError::unsupported(tool, "no mapping for language server backends"))?;

        if !capabilities.supports(spec.provider) {
            return Err(BridgeError::unsupported(
                tool,
                format!("backend {} does not advertise {}", descriptor.key(), spec.provider),
            ));
        }

        match spec.anchor {
            Anchor::Query => Ok(NativeRequest::new(
                spec.method,
                json!({ "query": query_arg(arguments)? }),
            )),
            Anchor::File => {
                let document = document_ref(file_arg(tool, arguments)?, &descriptor.root)?;
                Ok(NativeRequest::new(
                    spec.method,
                    json!({ "textDocument": { "uri": document.uri } }),
                )
                .with_document(document))
            }
            Anchor::Position => {
                let document = document_ref(file_arg(tool, arguments)?, &descriptor.root)?;
                let (line, column) = position_arg(tool, arguments)?;
                let mut params = json!({
                    "textDocument": { "uri": document.uri },
                    "position": { "line": line - 1, "character": column - 1 },
                });
                if tool == "references" {
                    let include_declaration = arguments
                        .get("include_declaration")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    params["context"] = json!({ "includeDeclaration": include_declaration });
                }
                Ok(NativeRequest::new(spec.method, params).with_document(document))
            }
        }
    }

    pub fn translate_response(&self, tool: &str, reply: NativeReply) -> BridgeResult<Value> {
        let result = reply.map_err(native_error)?;
        match tool {
            "hover" => Ok(hover(result)),
            "definition" | "references" => locations(result),
            "document_symbols" | "workspace_symbols" => symbols(result),
            "completion" => Ok(completion(result)),
            other => Err(BridgeError::unsupported(
                other,
                "no mapping for language server backends",
            )),
        }
    }

    pub fn handshake_request(&self, descriptor: &BackendDescriptor) -> (&'static str, Value) {
        let root_uri = Url::from_directory_path(&descriptor.root)
            .ok()
            .map(|u| u.to_string());
        let folder_name = descriptor
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| descriptor.root.display().to_string());
        let workspace_folders = match &root_uri {
            Some(uri) => json!([{ "uri": uri, "name": folder_name }]),
            None => Value::Null,
        };

        let mut params = json!({
            "processId": std::process::id(),
            "clientInfo": {
                "name": "langbridge",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "rootPath": descriptor.root.display().to_string(),
            "rootUri": root_uri,
            "workspaceFolders": workspace_folders,
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": false, "dynamicRegistration": false },
                    "hover": { "contentFormat": ["markdown", "plaintext"] },
                    "definition": { "linkSupport": true },
                    "references": {},
                    "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
                    "completion": { "completionItem": { "snippetSupport": false } },
                    "publishDiagnostics": { "relatedInformation": false },
                },
                "workspace": {
                    "symbol": {},
                    "configuration": true,
                    "workspaceFolders": true,
                },
                "window": { "workDoneProgress": true },
            },
        });
        if let Some(options) = &descriptor.initialization_options {
            params["initializationOptions"] = options.clone();
        }
        ("initialize", params)
    }

    pub fn answer_backend_request(
        &self,
        request: &Request,
        descriptor: &BackendDescriptor,
    ) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "workspace/configuration" => {
                let items = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .ok_or_else(RpcError::invalid_params)?;
                Ok(Value::Array(
                    items
                        .iter()
                        .map(|item| {
                            configuration_section(
                                descriptor.initialization_options.as_ref(),
                                item.get("section").and_then(Value::as_str),
                            )
                        })
                        .collect(),
                ))
            }
            "window/workDoneProgress/create"
            | "client/registerCapability"
            | "client/unregisterCapability"
            | "window/showMessageRequest" => Ok(Value::Null),
            "workspace/workspaceFolders" => {
                let (_, params) = self.handshake_request(descriptor);
                Ok(params["workspaceFolders"].clone())
            }
            "workspace/applyEdit" => Ok(json!({
                "applied": false,
                "failureReason": "edits are not applied through the bridge",
            })),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    pub fn translate_notification(
        &self,
        backend: &BackendKey,
        notification: &Notification,
    ) -> Vec<DiagnosticUpdate> {
        let params = notification.params.as_ref().unwrap_or(&Value::Null);
        match notification.method.as_str() {
            "textDocument/publishDiagnostics" => {
                let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                    return Vec::new();
                };
                let file = uri_to_file(uri);
                let events = params
                    .get("diagnostics")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|d| problem_event(backend, &file, d))
                            .collect()
                    })
                    .unwrap_or_default();
                vec![DiagnosticUpdate::Publish { file, events }]
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let severity =
                    Severity::from_lsp_message(params.get("type").and_then(Value::as_i64));
                vec![DiagnosticUpdate::Event(
                    DiagnosticEvent::new(backend.id(), severity, message)
                        .with_source(notification.method.clone()),
                )]
            }
            "$/logTrace" => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                vec![DiagnosticUpdate::Event(
                    DiagnosticEvent::new(backend.id(), Severity::Trace, message)
                        .with_source("$/logTrace"),
                )]
            }
            other => {
                trace!(backend = %backend, method = other, "Ignoring notification");
                Vec::new()
            }
        }
    }
}

pub(super) fn cancel_notification(id: &RequestId) -> Notification {
    Notification::new("$/cancelRequest").with_params(json!({ "id": id }))
}

pub(super) fn did_open(document: &DocumentRef, language_id: &str, text: String) -> Notification {
    Notification::new("textDocument/didOpen").with_params(json!({
        "textDocument": {
            "uri": document.uri,
            "languageId": language_id,
            "version": 1,
            "text": text,
        }
    }))
}

fn file_arg<'a>(tool: &str, arguments: &'a Value) -> BridgeResult<&'a str> {
    match arguments.get("file") {
        Some(Value::String(file)) if !file.is_empty() => Ok(file.as_str()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(missing_anchor(tool, arguments, "file")),
        Some(_) => Err(BridgeError::invalid_arguments("'file' must be a string")),
    }
}

fn position_arg(tool: &str, arguments: &Value) -> BridgeResult<(u32, u32)> {
    let line = one_based(tool, arguments, "line")?;
    let column = one_based(tool, arguments, "column")?;
    Ok((line, column))
}

fn one_based(tool: &str, arguments: &Value, name: &str) -> BridgeResult<u32> {
    match arguments.get(name) {
        None | Some(Value::Null) => Err(missing_anchor(tool, arguments, name)),
        Some(value) => value
            .as_u64()
            .filter(|n| *n >= 1 && *n <= u32::MAX as u64)
            .map(|n| n as u32)
            .ok_or_else(|| {
                BridgeError::invalid_arguments(format!(
                    "'{}' must be a positive integer (1-based)",
                    name
                ))
            }),
    }
}

/// Name-only lookups are refused rather than resolved by a hidden search
fn missing_anchor(tool: &str, arguments: &Value, name: &str) -> BridgeError {
    match arguments.get("symbol").and_then(Value::as_str) {
        Some(symbol) => BridgeError::unsupported(
            tool,
            format!(
                "lookup by symbol name is not supported; call workspace_symbols with query '{}' and retry with its file, line and column",
                symbol
            ),
        ),
        None => BridgeError::invalid_arguments(format!("missing required argument '{}'", name)),
    }
}

fn query_arg(arguments: &Value) -> BridgeResult<&str> {
    arguments
        .get("query")
        .or_else(|| arguments.get("symbol"))
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::invalid_arguments("missing required argument 'query'"))
}

fn document_ref(file: &str, root: &Path) -> BridgeResult<DocumentRef> {
    let path = Path::new(file);
    let path: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let uri = Url::from_file_path(&path).map_err(|_| {
        BridgeError::invalid_arguments(format!("cannot form a file URI for '{}'", path.display()))
    })?;
    Ok(DocumentRef {
        path,
        uri: uri.to_string(),
    })
}

fn uri_to_file(uri: &str) -> String {
    Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| uri.to_string())
}

fn position(value: &Value) -> Option<(u32, u32)> {
    let one_based = |key: &str| {
        let n = value.get(key)?.as_u64()?;
        u32::try_from(n).ok()?.checked_add(1)
    };
    Some((one_based("line")?, one_based("character")?))
}

fn range_location(file: &str, range: &Value) -> Option<Location> {
    let (line, column) = position(range.get("start")?)?;
    let (end_line, end_column) = position(range.get("end")?)?;
    Some(Location {
        file: file.to_string(),
        line,
        column,
        end_line,
        end_column,
    })
}

fn range_json(range: &Value) -> Option<Value> {
    let location = range_location("", range)?;
    Some(json!({
        "line": location.line,
        "column": location.column,
        "end_line": location.end_line,
        "end_column": location.end_column,
    }))
}

/// `Location` or `LocationLink`
fn location(value: &Value) -> Option<Location> {
    if let Some(uri) = value.get("targetUri").and_then(Value::as_str) {
        let range = value
            .get("targetSelectionRange")
            .or_else(|| value.get("targetRange"))?;
        return range_location(&uri_to_file(uri), range);
    }
    let uri = value.get("uri").and_then(Value::as_str)?;
    range_location(&uri_to_file(uri), value.get("range")?)
}

fn locations(result: Value) -> BridgeResult<Value> {
    let items = match result {
        Value::Null => return Ok(json!([])),
        Value::Array(items) => items,
        single => vec![single],
    };
    let mut out = Vec::with_capacity(items.len());
    for item in &items {
        let location = location(item).ok_or_else(|| {
            BridgeError::translation(format!("not an LSP location: {}", item))
        })?;
        out.push(serde_json::to_value(location)?);
    }
    Ok(Value::Array(out))
}

fn markup_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(markup_text)
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(obj) => obj
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

/// LSP hovers are normalised; anything else is passed through
fn hover(result: Value) -> Value {
    let Some(contents) = result.get("contents") else {
        return result;
    };
    let mut out = Map::new();
    out.insert("contents".to_string(), Value::String(markup_text(contents)));
    if let Some(range) = result.get("range").and_then(range_json) {
        out.insert("range".to_string(), range);
    }
    Value::Object(out)
}

fn kind_name(names: &[&str], kind: Option<&Value>) -> Value {
    kind.and_then(Value::as_u64)
        .and_then(|k| names.get((k as usize).wrapping_sub(1)))
        .map(|name| Value::String(name.to_string()))
        .unwrap_or(Value::Null)
}

fn symbols(result: Value) -> BridgeResult<Value> {
    let items = match result {
        Value::Null => return Ok(json!([])),
        Value::Array(items) => items,
        other => {
            return Err(BridgeError::translation(format!(
                "expected a symbol list, got {}",
                other
            )));
        }
    };
    let mut out = Vec::new();
    for item in &items {
        flatten_symbol(item, None, &mut out)?;
    }
    Ok(Value::Array(out))
}

/// Flatten `DocumentSymbol` trees and `SymbolInformation`/`WorkspaceSymbol` lists
fn flatten_symbol(item: &Value, container: Option<&str>, out: &mut Vec<Value>) -> BridgeResult<()> {
    let name = item
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::translation(format!("symbol without a name: {}", item)))?;

    let mut entry = Map::new();
    entry.insert("name".to_string(), Value::String(name.to_string()));
    entry.insert("kind".to_string(), kind_name(&SYMBOL_KINDS, item.get("kind")));

    let container = container.or_else(|| item.get("containerName").and_then(Value::as_str));
    if let Some(container) = container {
        entry.insert("container".to_string(), Value::String(container.to_string()));
    }
    if let Some(detail) = item.get("detail").and_then(Value::as_str) {
        entry.insert("detail".to_string(), Value::String(detail.to_string()));
    }

    if let Some(range) = item.get("selectionRange").or_else(|| item.get("range")) {
        if let Some(Value::Object(range)) = range_json(range) {
            entry.extend(range);
        }
    } else if let Some(loc) = item.get("location") {
        match location(loc) {
            Some(location) => {
                if let Value::Object(fields) = serde_json::to_value(location)? {
                    entry.extend(fields);
                }
            }
            // WorkspaceSymbol may carry only a URI
            None => {
                if let Some(uri) = loc.get("uri").and_then(Value::as_str) {
                    entry.insert("file".to_string(), Value::String(uri_to_file(uri)));
                }
            }
        }
    }
    out.push(Value::Object(entry));

    if let Some(children) = item.get("children").and_then(Value::as_array) {
        for child in children {
            flatten_symbol(child, Some(name), out)?;
        }
    }
    Ok(())
}

fn completion(result: Value) -> Value {
    let (items, is_incomplete) = match result {
        Value::Null => (Vec::new(), false),
        Value::Array(items) => (items, false),
        Value::Object(mut list) => {
            let is_incomplete = list
                .get("isIncomplete")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let items = match list.remove("items") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            (items, is_incomplete)
        }
        other => (vec![other], false),
    };

    let items: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut entry = Map::new();
            let label = item
                .get("label")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string());
            entry.insert("label".to_string(), Value::String(label));
            let kind = kind_name(&COMPLETION_KINDS, item.get("kind"));
            if !kind.is_null() {
                entry.insert("kind".to_string(), kind);
            }
            if let Some(detail) = item.get("detail").and_then(Value::as_str) {
                entry.insert("detail".to_string(), Value::String(detail.to_string()));
            }
            if let Some(doc) = item.get("documentation") {
                entry.insert("documentation".to_string(), Value::String(markup_text(doc)));
            }
            let insert_text = item
                .get("insertText")
                .and_then(Value::as_str)
                .or_else(|| {
                    item.get("textEdit")
                        .and_then(|e| e.get("newText"))
                        .and_then(Value::as_str)
                });
            if let Some(text) = insert_text {
                entry.insert("insert_text".to_string(), Value::String(text.to_string()));
            }
            Value::Object(entry)
        })
        .collect();

    json!({ "items": items, "is_incomplete": is_incomplete })
}

fn problem_event(backend: &BackendKey, file: &str, diagnostic: &Value) -> DiagnosticEvent {
    let message = diagnostic
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let severity = Severity::from_lsp_diagnostic(diagnostic.get("severity").and_then(Value::as_i64));
    let mut event = DiagnosticEvent::new(backend.id(), severity, message);

    let source = diagnostic.get("source").and_then(Value::as_str);
    let code = diagnostic.get("code").and_then(|c| match c {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    match (source, code) {
        (Some(source), Some(code)) => event = event.with_source(format!("{}({})", source, code)),
        (Some(source), None) => event = event.with_source(source),
        (None, Some(code)) => event = event.with_source(code),
        (None, None) => {}
    }

    if let Some(location) = diagnostic.get("range").and_then(|r| range_location(file, r)) {
        event = event.with_location(location);
    }
    event
}

/// Value of a dotted configuration section inside the initialization options
fn configuration_section(options: Option<&Value>, section: Option<&str>) -> Value {
    let Some(options) = options else {
        return Value::Null;
    };
    let Some(section) = section else {
        return options.clone();
    };
    section
        .split('.')
        .try_fold(options, |value, part| value.get(part))
        .cloned()
        .unwrap_or(Value::Null)
}
