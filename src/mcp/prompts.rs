//! Prompt providers

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Result, ValidationError};
use crate::mcp::types::{Content, GetPromptResult, Prompt, PromptArgument, PromptMessage, Role};

#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn list(&self) -> Result<Vec<Prompt>>;

    /// Render a prompt, or `None` if the name is unknown
    async fn get(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<Option<GetPromptResult>>;
}

/// Fail if any required argument of `prompt` is missing
pub fn check_required_arguments(
    prompt: &Prompt,
    arguments: &HashMap<String, String>,
) -> std::result::Result<(), ValidationError> {
    match prompt
        .arguments
        .iter()
        .find(|a| a.required && !arguments.contains_key(&a.name))
    {
        Some(missing) => Err(ValidationError::MissingField {
            field: missing.name.clone(),
        }),
        None => Ok(()),
    }
}

/// Substitute `{{name}}` placeholders; placeholders of declared but absent arguments become empty
///
/// One pass over the template, so argument values are never re-scanned.
/// Placeholders naming undeclared arguments are left as written.
pub fn render_template(
    template: &str,
    declared: &[PromptArgument],
    arguments: &HashMap<String, String>,
) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            rest = &rest[start..];
            break;
        };
        let name = &after_open[..end];
        if declared.iter().any(|a| a.name == name) {
            rendered.push_str(arguments.get(name).map(String::as_str).unwrap_or(""));
        } else {
            rendered.push_str(&rest[start..start + end + 4]);
        }
        rest = &after_open[end + 2..];
    }
    rendered.push_str(rest);
    rendered
}

struct PromptTemplate {
    prompt: Prompt,
    template: String,
}

/// Prompts rendered from fixed templates as a single user message
#[derive(Default)]
pub struct StaticPrompts {
    templates: Vec<PromptTemplate>,
}

impl StaticPrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: Prompt, template: impl Into<String>) -> Self {
        self.templates.push(PromptTemplate {
            prompt,
            template: template.into(),
        });
        self
    }
}

#[async_trait]
impl PromptProvider for StaticPrompts {
    async fn list(&self) -> Result<Vec<Prompt>> {
        Ok(self.templates.iter().map(|t| t.prompt.clone()).collect())
    }

    async fn get(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<Option<GetPromptResult>> {
        let Some(entry) = self.templates.iter().find(|t| t.prompt.name == name) else {
            return Ok(None);
        };
        let text = render_template(&entry.template, &entry.prompt.arguments, arguments);
        Ok(Some(GetPromptResult {
            description: entry.prompt.description.clone(),
            messages: vec![PromptMessage {
                role: Role::User,
                content: Content::text(text),
            }],
        }))
    }
}
