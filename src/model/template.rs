use crate::{
    error::ServiceError,
    model::{ChatMessage, ChatRole},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// `<|im_start|>role ... <|im_end|>` (Qwen, Yi, many fine-tunes).
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>` (Llama 3).
    Llama3,
    /// `<start_of_turn>user|model` (Gemma); no system role.
    Gemma,
    /// `[INST] ... [/INST]` (Llama 2, Mistral); system folded into the first turn.
    Inst,
}

impl ChatTemplate {
    pub fn detect(source: &str) -> Option<Self> {
        if source.contains("<|im_start|>") {
            Some(ChatTemplate::ChatMl)
        } else if source.contains("<|start_header_id|>") {
            Some(ChatTemplate::Llama3)
        } else if source.contains("<start_of_turn>") {
            Some(ChatTemplate::Gemma)
        } else if source.contains("[INST]") {
            Some(ChatTemplate::Inst)
        } else {
            None
        }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self {
            ChatTemplate::ChatMl => {
                let mut out = String::new();
                for msg in messages {
                    out.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        msg.role.as_str(),
                        msg.content
                    ));
                }
                out.push_str("<|im_start|>assistant\n");
                out
            }
            ChatTemplate::Llama3 => {
                let mut out = String::new();
                for msg in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        msg.role.as_str(),
                        msg.content.trim()
                    ));
                }
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                out
            }
            ChatTemplate::Gemma => {
                let (system, turns) = split_system(messages);
                let mut out = String::new();
                for (idx, (role, content)) in turns.iter().enumerate() {
                    let role_name = match role {
                        ChatRole::Assistant => "model",
                        ChatRole::User | ChatRole::System => "user",
                    };
                    let content = match (&system, idx) {
                        (Some(system), 0) => format!("{system}\n\n{content}"),
                        _ => content.to_string(),
                    };
                    out.push_str(&format!(
                        "<start_of_turn>{role_name}\n{}<end_of_turn>\n",
                        content.trim()
                    ));
                }
                out.push_str("<start_of_turn>model\n");
                out
            }
            ChatTemplate::Inst => {
                let (system, turns) = split_system(messages);
                let mut out = String::new();
                let mut first_user = true;
                for (role, content) in &turns {
                    match role {
                        ChatRole::Assistant => {
                            out.push_str(&format!(" {}</s>", content.trim()));
                        }
                        ChatRole::User | ChatRole::System => {
                            let content = match (&system, first_user) {
                                (Some(system), true) => {
                                    format!("<<SYS>>\n{system}\n<</SYS>>\n\n{}", content.trim())
                                }
                                _ => content.trim().to_string(),
                            };
                            first_user = false;
                            out.push_str(&format!("[INST] {content} [/INST]"));
                        }
                    }
                }
                out
            }
        }
    }
}

pub fn apply_chat_template(
    source: Option<&str>,
    messages: &[ChatMessage],
) -> Result<String, ServiceError> {
    let source =
        source.ok_or_else(|| ServiceError::Tokenizer("tokenizer has no chat template".into()))?;
    let template = ChatTemplate::detect(source).ok_or_else(|| {
        ServiceError::Tokenizer("chat template is not in a supported format".into())
    })?;
    Ok(template.render(messages))
}

pub fn fallback_transcript(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .map(|msg| {
            let label = match msg.role {
                ChatRole::System => "System",
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            format!("{label}: {}", msg.content)
        })
        .collect();
    parts.push("Assistant:".to_string());
    parts.join("\n")
}

fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<(ChatRole, &str)>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let turns = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}
