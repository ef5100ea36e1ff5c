use parley_storage::{Conversation, MessageRole};
use parley_transport::{ChatRequest, Endpoint, ModelConfigs, WireMessage, WireRole};

/// Authenticated identity on whose behalf a prompt is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    /// Returns `None` for a blank id, which counts as "not logged in".
    pub fn new(user_id: impl Into<String>) -> Option<Self> {
        let user_id = user_id.into().trim().to_string();
        (!user_id.is_empty()).then_some(Self { user_id })
    }
}

/// Per-submission generation knobs. Unset fields fall back to engine defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub system_instruction: Option<String>,
    /// Overrides the conversation's stored template for this submission.
    pub template: Option<String>,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn or(self, defaults: &GenerationParams) -> Self {
        Self {
            temperature: self.temperature.or(defaults.temperature),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            system_instruction: non_blank(self.system_instruction)
                .or_else(|| non_blank(defaults.system_instruction.clone())),
            template: non_blank(self.template).or_else(|| non_blank(defaults.template.clone())),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Builds the wire request and route for one submission.
///
/// `conversation` is the thread as it was before the new entry opened. A
/// template (explicit or stored) replaces the history and routes to the plain
/// completion endpoint; otherwise the full history goes to the caller's chain.
pub(crate) fn build_exchange(
    conversation: &Conversation,
    prompt: &str,
    params: &GenerationParams,
    caller: &Caller,
) -> (ChatRequest, Endpoint) {
    let template = params
        .template
        .clone()
        .or_else(|| conversation.active_template().map(str::to_string));

    let mut messages = Vec::with_capacity(conversation.thread.len() * 2 + 2);
    if let Some(instruction) = &params.system_instruction {
        messages.push(WireMessage::system(instruction.clone()));
    }
    if template.is_none() {
        for entry in &conversation.thread {
            messages.push(WireMessage::user(entry.input.clone()));
            if !entry.message.content.is_empty() {
                messages.push(WireMessage::new(
                    wire_role(entry.message.role),
                    entry.message.content.clone(),
                ));
            }
        }
    }
    messages.push(WireMessage::user(prompt));

    let mut request = ChatRequest::new(messages).with_configs(ModelConfigs {
        max_tokens: params.max_tokens,
        temperature: params.temperature,
    });
    if let Some(instruction) = &params.system_instruction {
        request = request.with_system_instruction(instruction.clone());
    }

    let endpoint = match template {
        Some(template) => {
            request = request.with_template(template);
            Endpoint::Completion
        }
        None => Endpoint::Chain {
            user_id: caller.user_id.clone(),
        },
    };

    (request, endpoint)
}

fn wire_role(role: MessageRole) -> WireRole {
    match role {
        MessageRole::System => WireRole::System,
        MessageRole::User => WireRole::User,
        MessageRole::Assistant => WireRole::Assistant,
    }
}
