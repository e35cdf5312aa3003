//! What the engine hands back when it stops at a gate.
//!
//! The engine never sends messages itself. The transport renders each
//! [`PendingConfirmation`] however it likes and returns the token with the
//! chosen option id to `resume`.

use chrono::{DateTime, Utc};
use gatehouse_types::{ItemId, PendingPrompt, WorkflowInstance, WorkflowInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptChoice {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub instance_id: WorkflowInstanceId,
    pub token: String,
    pub action: String,
    pub prompt_text: String,
    pub options: Vec<PromptChoice>,
    /// Set when the prompt decides a single item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    pub expires_at: DateTime<Utc>,
}

impl PendingConfirmation {
    pub fn from_prompt(instance_id: &WorkflowInstanceId, prompt: &PendingPrompt) -> Self {
        Self {
            instance_id: instance_id.clone(),
            token: prompt.token.clone(),
            action: prompt.action.clone(),
            prompt_text: prompt.prompt_text.clone(),
            options: prompt
                .options
                .iter()
                .map(|o| PromptChoice {
                    id: o.id.clone(),
                    label: o.label.clone(),
                })
                .collect(),
            item_id: prompt.item_id.clone(),
            expires_at: prompt.expires_at,
        }
    }
}

/// An instance stopped at a gate, with everything the human can answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub instance_id: WorkflowInstanceId,
    pub prompts: Vec<PendingConfirmation>,
}

impl Suspension {
    pub fn of(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            prompts: instance
                .pending
                .iter()
                .map(|p| PendingConfirmation::from_prompt(&instance.id, p))
                .collect(),
        }
    }

    /// The gate's own prompt: the only one at a single gate, the sign-off
    /// at a per-item gate.
    pub fn single(&self) -> Option<&PendingConfirmation> {
        self.prompts.iter().find(|p| p.item_id.is_none())
    }

    pub fn sign_off(&self) -> Option<&PendingConfirmation> {
        self.single()
    }

    pub fn for_item(&self, item_id: &ItemId) -> Option<&PendingConfirmation> {
        self.prompts
            .iter()
            .find(|p| p.item_id.as_ref() == Some(item_id))
    }

    pub fn item_prompts(&self) -> impl Iterator<Item = &PendingConfirmation> {
        self.prompts.iter().filter(|p| p.item_id.is_some())
    }
}

/// Replace `{key}` with the top-level scalar `params[key]`.
///
/// Unknown keys and non-scalar values are left as written.
pub fn render_template(template: &str, params: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        match params.get(key).and_then(scalar) {
            Some(text) => out.push_str(&text),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() => format!("{f:.2}"),
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
