//! Kernel messages decoded into a closed set of kinds.
//!
//! Decoding happens once, where messages leave the transport. Everything
//! downstream matches on [`ProtocolContent`] instead of looking up
//! `header.msg_type` strings.

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use jupyter_server::KernelStatus;
use notebook_doc::{MimeBundle, Output, OutputType};
use serde_json::{json, Map, Value};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolContent {
    /// The kernel accepted the request and assigned it an execution count.
    ExecuteInput { code: String, execution_count: i64 },
    /// `stream`, `display_data`, `execute_result` or `error`.
    Output(Output),
    UpdateDisplayData {
        display_id: String,
        data: MimeBundle,
        metadata: Map<String, Value>,
    },
    ClearOutput { wait: bool },
    Status(KernelStatus),
    ExecuteReply {
        status: ReplyStatus,
        execution_count: Option<i64>,
    },
    /// A message kind this client does not act on (comms, input requests).
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub msg_id: String,
    pub msg_type: String,
    pub parent_msg_id: Option<String>,
    pub content: ProtocolContent,
}

impl ProtocolMessage {
    pub fn decode(
        msg_id: impl Into<String>,
        msg_type: impl Into<String>,
        parent_msg_id: Option<String>,
        content: &Value,
    ) -> Result<Self, SessionError> {
        let msg_type = msg_type.into();
        let content = decode_content(&msg_type, content)?;
        Ok(ProtocolMessage {
            msg_id: msg_id.into(),
            msg_type,
            parent_msg_id,
            content,
        })
    }

    /// Decode a JSON envelope: `header`, `parent_header`, `content`.
    pub fn from_envelope(envelope: &Value) -> Result<Self, SessionError> {
        let header = envelope
            .get("header")
            .ok_or_else(|| SessionError::malformed("unknown", "missing `header`"))?;
        let msg_type = header
            .get("msg_type")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::malformed("unknown", "missing `header.msg_type`"))?;
        let msg_id = header
            .get("msg_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parent_msg_id = envelope
            .get("parent_header")
            .and_then(|p| p.get("msg_id"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let content = envelope.get("content").unwrap_or(&Value::Null);
        Self::decode(msg_id, msg_type, parent_msg_id, content)
    }

    /// Decode a message read from a `runtimelib` connection.
    pub fn from_jupyter(message: &JupyterMessage) -> Result<Self, SessionError> {
        Self::decode(
            message.header.msg_id.clone(),
            message.header.msg_type.clone(),
            message
                .parent_header
                .as_ref()
                .map(|h| h.msg_id.clone())
                .filter(|id| !id.is_empty()),
            &content_to_json(&message.content),
        )
    }

    pub fn status(&self) -> Option<KernelStatus> {
        match self.content {
            ProtocolContent::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status() == Some(KernelStatus::Idle)
    }

    pub fn is_reply_to(&self, msg_id: &str) -> bool {
        self.parent_msg_id.as_deref() == Some(msg_id)
    }
}

fn decode_content(msg_type: &str, content: &Value) -> Result<ProtocolContent, SessionError> {
    match msg_type {
        "stream" | "display_data" | "execute_result" | "error" => {
            let output_type: OutputType = msg_type
                .parse()
                .map_err(|e| SessionError::malformed(msg_type, format!("{}", e)))?;
            let output = Output::parse(content, output_type)
                .map_err(|e| SessionError::malformed(msg_type, e.to_string()))?;
            Ok(ProtocolContent::Output(output.into_line_form()))
        }
        "execute_input" => Ok(ProtocolContent::ExecuteInput {
            code: content
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            execution_count: content
                .get("execution_count")
                .and_then(Value::as_i64)
                .ok_or_else(|| SessionError::malformed(msg_type, "missing `execution_count`"))?,
        }),
        "update_display_data" => {
            let display_id = content
                .get("transient")
                .and_then(|t| t.get("display_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| SessionError::malformed(msg_type, "missing `transient.display_id`"))?;
            let data = content
                .get("data")
                .and_then(Value::as_object)
                .map(MimeBundle::from_map)
                .ok_or_else(|| SessionError::malformed(msg_type, "missing `data`"))?;
            let metadata = content
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Ok(ProtocolContent::UpdateDisplayData {
                display_id: display_id.to_string(),
                data: data.into_line_form(),
                metadata,
            })
        }
        "clear_output" => Ok(ProtocolContent::ClearOutput {
            wait: content.get("wait").and_then(Value::as_bool).unwrap_or(false),
        }),
        "status" => content
            .get("execution_state")
            .and_then(Value::as_str)
            .map(|state| ProtocolContent::Status(KernelStatus::from_execution_state(state)))
            .ok_or_else(|| SessionError::malformed(msg_type, "missing `execution_state`")),
        "execute_reply" => {
            let status = match content.get("status").and_then(Value::as_str) {
                Some("ok") => ReplyStatus::Ok,
                Some("error") => ReplyStatus::Error,
                Some("aborted") => ReplyStatus::Aborted,
                _ => return Err(SessionError::malformed(msg_type, "missing `status`")),
            };
            Ok(ProtocolContent::ExecuteReply {
                status,
                execution_count: content.get("execution_count").and_then(Value::as_i64),
            })
        }
        _ => Ok(ProtocolContent::Other),
    }
}

/// nbformat-shaped JSON for the message kinds this client decodes.
fn content_to_json(content: &JupyterMessageContent) -> Value {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            json!({ "name": name, "text": stream.text })
        }
        JupyterMessageContent::DisplayData(data) => {
            let mut value = json!({ "data": data.data, "metadata": data.metadata });
            if let Some(display_id) = data.transient.as_ref().and_then(|t| t.display_id.as_ref()) {
                value["transient"] = json!({ "display_id": display_id });
            }
            value
        }
        JupyterMessageContent::UpdateDisplayData(update) => json!({
            "data": update.data,
            "metadata": update.metadata,
            "transient": { "display_id": update.transient.display_id },
        }),
        JupyterMessageContent::ExecuteResult(result) => json!({
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0,
        }),
        JupyterMessageContent::ErrorOutput(error) => json!({
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback,
        }),
        JupyterMessageContent::ExecuteInput(input) => json!({
            "code": input.code,
            "execution_count": input.execution_count.0,
        }),
        JupyterMessageContent::ClearOutput(clear) => json!({ "wait": clear.wait }),
        JupyterMessageContent::Status(status) => {
            let state = match status.execution_state {
                jupyter_protocol::ExecutionState::Busy => "busy",
                jupyter_protocol::ExecutionState::Idle => "idle",
                jupyter_protocol::ExecutionState::Starting => "starting",
                jupyter_protocol::ExecutionState::Restarting => "restarting",
                jupyter_protocol::ExecutionState::Terminating
                | jupyter_protocol::ExecutionState::Dead => "dead",
                _ => "unknown",
            };
            json!({ "execution_state": state })
        }
        JupyterMessageContent::ExecuteReply(reply) => {
            let status = if reply.status == jupyter_protocol::ReplyStatus::Ok {
                "ok"
            } else {
                "error"
            };
            json!({ "status": status, "execution_count": reply.execution_count.0 })
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(msg_type: &str, parent: &str, content: Value) -> Value {
        json!({
            "header": { "msg_id": "m1", "msg_type": msg_type, "session": "s" },
            "parent_header": { "msg_id": parent },
            "metadata": {},
            "content": content,
        })
    }

    #[test]
    fn test_execute_result_decodes_to_output() {
        let message = ProtocolMessage::from_envelope(&envelope(
            "execute_result",
            "req-1",
            json!({"data": {"text/plain": "2"}, "metadata": {}, "execution_count": 1}),
        ))
        .unwrap();

        assert_eq!(message.msg_type, "execute_result");
        assert!(message.is_reply_to("req-1"));
        match message.content {
            ProtocolContent::Output(Output::ExecuteResult {
                data,
                execution_count,
                ..
            }) => {
                assert_eq!(execution_count, Some(1));
                assert_eq!(data.plain().as_deref(), Some("2"));
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_status_idle() {
        let message = ProtocolMessage::from_envelope(&envelope(
            "status",
            "req-1",
            json!({"execution_state": "idle"}),
        ))
        .unwrap();
        assert!(message.is_idle());

        let busy = ProtocolMessage::from_envelope(&envelope(
            "status",
            "req-1",
            json!({"execution_state": "busy"}),
        ))
        .unwrap();
        assert_eq!(busy.status(), Some(KernelStatus::Busy));
        assert!(!busy.is_idle());
    }

    #[test]
    fn test_display_keeps_display_id() {
        let message = ProtocolMessage::from_envelope(&envelope(
            "display_data",
            "req-1",
            json!({"data": {"text/plain": "50%"}, "metadata": {}, "transient": {"display_id": "bar"}}),
        ))
        .unwrap();
        match message.content {
            ProtocolContent::Output(output) => assert_eq!(output.display_id(), Some("bar")),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_update_display_data_requires_display_id() {
        let ok = ProtocolMessage::from_envelope(&envelope(
            "update_display_data",
            "req-1",
            json!({"data": {"text/plain": "100%"}, "metadata": {}, "transient": {"display_id": "bar"}}),
        ))
        .unwrap();
        assert!(matches!(
            ok.content,
            ProtocolContent::UpdateDisplayData { ref display_id, .. } if display_id == "bar"
        ));

        let err = ProtocolMessage::from_envelope(&envelope(
            "update_display_data",
            "req-1",
            json!({"data": {"text/plain": "100%"}, "metadata": {}, "transient": {}}),
        ))
        .unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage { .. }));
    }

    #[test]
    fn test_malformed_output_is_an_error() {
        let err = ProtocolMessage::from_envelope(&envelope(
            "stream",
            "req-1",
            json!({"name": "stdout"}),
        ))
        .unwrap_err();
        assert!(matches!(err, SessionError::MalformedMessage { ref msg_type, .. } if msg_type == "stream"));
    }

    #[test]
    fn test_unknown_kinds_are_other() {
        let message = ProtocolMessage::from_envelope(&envelope(
            "comm_msg",
            "req-1",
            json!({"comm_id": "c", "data": {}}),
        ))
        .unwrap();
        assert_eq!(message.content, ProtocolContent::Other);
    }

    #[test]
    fn test_empty_parent_header_has_no_parent() {
        let message = ProtocolMessage::from_envelope(&json!({
            "header": { "msg_id": "m", "msg_type": "status" },
            "parent_header": {},
            "content": { "execution_state": "starting" },
        }))
        .unwrap();
        assert_eq!(message.parent_msg_id, None);
        assert_eq!(message.status(), Some(KernelStatus::Starting));
    }

    #[test]
    fn test_execute_reply_status() {
        let message = ProtocolMessage::from_envelope(&envelope(
            "execute_reply",
            "req-1",
            json!({"status": "error", "execution_count": 3, "ename": "E", "evalue": "", "traceback": []}),
        ))
        .unwrap();
        assert_eq!(
            message.content,
            ProtocolContent::ExecuteReply {
                status: ReplyStatus::Error,
                execution_count: Some(3),
            }
        );
    }
}
