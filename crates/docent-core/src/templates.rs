use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TEMPLATE: &str = "default";
pub const RAG_TEMPLATE: &str = "rag";
pub const CHAT_TEMPLATE: &str = "chat";

/// A named pair of system/user text skeletons with `{placeholder}` slots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: String,
    pub system_text: String,
    pub user_text: String,
}

impl PromptTemplate {
    pub fn new(
        name: impl Into<String>,
        system_text: impl Into<String>,
        user_text: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_text: system_text.into(),
            user_text: user_text.into(),
        }
    }

    /// Placeholder names referenced by either text, in order of first use.
    pub fn placeholders(&self) -> Result<Vec<String>, FormattingError> {
        let mut names = Vec::new();
        for text in [&self.system_text, &self.user_text] {
            for segment in parse_segments(&self.name, text)? {
                if let Segment::Placeholder(name) = segment {
                    if !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPrompt {
    /// Name of the template actually used, after default resolution.
    pub template: String,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormattingError {
    #[error("template {template}: no value supplied for placeholder {{{placeholder}}}")]
    MissingValue {
        template: String,
        placeholder: String,
    },
    #[error("template {template}: unbalanced brace at byte {offset}")]
    UnbalancedBrace { template: String, offset: usize },
    #[error("template {template}: empty placeholder at byte {offset}")]
    EmptyPlaceholder { template: String, offset: usize },
    #[error("template {template} has empty system text")]
    EmptySystemText { template: String },
}

/// Process-wide prompt templates, seeded with `default`, `rag` and `chat`.
///
/// Templates are handed out as shared `Arc`s and never mutated after
/// registration; registering under an existing name replaces the entry.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<PromptTemplate>>,
    default: Arc<PromptTemplate>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let default = Arc::new(PromptTemplate::new(
            DEFAULT_TEMPLATE,
            "You are a helpful documentation assistant for a Slack workspace. \
             Answer accurately and concisely. If you are not sure, say so instead of guessing.",
            "Context:\n{context}\n\nQuestion: {query}",
        ));
        let rag = Arc::new(PromptTemplate::new(
            RAG_TEMPLATE,
            "You are a documentation assistant. Answer using only the numbered passages \
             below and cite them by number, for example [1]. If the passages do not contain \
             the answer, say that it is not covered by the documentation.\n\n\
             Passages:\n{context}",
            "{query}",
        ));
        let chat = Arc::new(PromptTemplate::new(
            CHAT_TEMPLATE,
            "You are a friendly assistant chatting in a Slack channel. Keep replies short \
             and conversational.\n\nBackground (may be empty):\n{context}",
            "{query}",
        ));

        let mut templates = HashMap::new();
        templates.insert(DEFAULT_TEMPLATE.to_string(), Arc::clone(&default));
        templates.insert(RAG_TEMPLATE.to_string(), rag);
        templates.insert(CHAT_TEMPLATE.to_string(), chat);
        Self { templates, default }
    }

    /// Add or replace a template. Rejects empty system text and malformed
    /// braces up front so `format` only fails on missing values.
    pub fn register(&mut self, template: PromptTemplate) -> Result<(), FormattingError> {
        if template.system_text.trim().is_empty() {
            return Err(FormattingError::EmptySystemText {
                template: template.name,
            });
        }
        template.placeholders()?;

        let template = Arc::new(template);
        if template.name == DEFAULT_TEMPLATE {
            self.default = Arc::clone(&template);
        }
        tracing::debug!(template = %template.name, "registered prompt template");
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    /// Unknown names resolve to the `default` template.
    pub fn get(&self, template_type: &str) -> Arc<PromptTemplate> {
        match self.templates.get(template_type) {
            Some(template) => Arc::clone(template),
            None => {
                tracing::warn!(
                    template = template_type,
                    "unknown prompt template, using default"
                );
                Arc::clone(&self.default)
            }
        }
    }

    pub fn contains(&self, template_type: &str) -> bool {
        self.templates.contains_key(template_type)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Substitute `context`, `query` and `extra` into both texts of the
    /// resolved template.
    pub fn format(
        &self,
        template_type: &str,
        context: &str,
        query: &str,
        extra: &HashMap<String, String>,
    ) -> Result<FormattedPrompt, FormattingError> {
        let template = self.get(template_type);

        let mut values: HashMap<&str, &str> = extra
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        values.insert("context", context);
        values.insert("query", query);

        Ok(FormattedPrompt {
            template: template.name.clone(),
            system: render(&template.name, &template.system_text, &values)?,
            user: render(&template.name, &template.user_text, &values)?,
        })
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

/// `{{` and `}}` are literal braces; `{name}` is a placeholder.
fn parse_segments<'a>(template: &str, text: &'a str) -> Result<Vec<Segment<'a>>, FormattingError> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                segments.push(Segment::Literal(&text[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                let close = text[i + 1..]
                    .find(['{', '}'])
                    .map(|rel| i + 1 + rel)
                    .filter(|&end| bytes[end] == b'}')
                    .ok_or_else(|| FormattingError::UnbalancedBrace {
                        template: template.to_string(),
                        offset: i,
                    })?;
                let name = text[i + 1..close].trim();
                if name.is_empty() {
                    return Err(FormattingError::EmptyPlaceholder {
                        template: template.to_string(),
                        offset: i,
                    });
                }
                segments.push(Segment::Literal(&text[literal_start..i]));
                segments.push(Segment::Placeholder(name));
                i = close + 1;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                segments.push(Segment::Literal(&text[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'}' => {
                return Err(FormattingError::UnbalancedBrace {
                    template: template.to_string(),
                    offset: i,
                });
            }
            _ => i += 1,
        }
    }
    segments.push(Segment::Literal(&text[literal_start..]));
    Ok(segments)
}

fn render(
    template: &str,
    text: &str,
    values: &HashMap<&str, &str>,
) -> Result<String, FormattingError> {
    let mut out = String::with_capacity(text.len());
    for segment in parse_segments(template, text)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Placeholder(name) => {
                let value = values
                    .get(name)
                    .ok_or_else(|| FormattingError::MissingValue {
                        template: template.to_string(),
                        placeholder: name.to_string(),
                    })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}
