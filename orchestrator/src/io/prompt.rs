//! Agent prompt rendering for command-backed executors.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::Value;

use crate::core::task::AgentInvocation;

const AGENT_TEMPLATE: &str = include_str!("prompts/agent.md");

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.add_template("agent", AGENT_TEMPLATE)
            .context("load agent prompt template")?;
        Ok(Self { env })
    }

    /// Render the prompt piped to an agent command.
    ///
    /// `context` is embedded as pretty JSON; a null context is omitted.
    pub fn render_agent(
        &self,
        invocation: &AgentInvocation,
        result_path: Option<&Path>,
    ) -> Result<String> {
        let prompt = &invocation.prompt;
        let context_json = match &prompt.context {
            Value::Null => None,
            value => Some(serde_json::to_string_pretty(value).context("serialize prompt context")?),
        };
        let template = self.env.get_template("agent")?;
        let rendered = template
            .render(context! {
                agent => invocation.agent.as_str(),
                role => prompt.role.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                task => prompt.task.trim(),
                instructions => &prompt.instructions,
                context => context_json,
                output_format => prompt.output_format.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                result_path => result_path.map(|path| path.display().to_string()),
            })
            .with_context(|| format!("render prompt for agent '{}'", invocation.agent))?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::AgentPrompt;
    use serde_json::json;

    fn invocation(prompt: AgentPrompt) -> AgentInvocation {
        AgentInvocation {
            agent: "planner".to_string(),
            prompt,
        }
    }

    #[test]
    fn renders_every_section() {
        let renderer = PromptRenderer::new().expect("renderer");
        let rendered = renderer
            .render_agent(
                &invocation(AgentPrompt {
                    role: Some("a cluster architect".to_string()),
                    task: "Design the node pools".to_string(),
                    instructions: vec!["Prefer spot capacity".to_string(), "Stay in budget".to_string()],
                    context: json!({"region": "eu-west-1"}),
                    output_format: Some("JSON with a `pools` array".to_string()),
                }),
                Some(Path::new("/tmp/result.json")),
            )
            .expect("render");

        assert!(rendered.contains("You are a cluster architect."));
        assert!(rendered.contains("# Task\n\nDesign the node pools"));
        assert!(rendered.contains("- Prefer spot capacity\n- Stay in budget"));
        assert!(rendered.contains("\"region\": \"eu-west-1\""));
        assert!(rendered.contains("JSON with a `pools` array"));
        assert!(rendered.contains("/tmp/result.json"));
    }

    #[test]
    fn omits_empty_sections() {
        let renderer = PromptRenderer::new().expect("renderer");
        let rendered = renderer
            .render_agent(
                &invocation(AgentPrompt {
                    role: None,
                    task: "Summarize".to_string(),
                    instructions: Vec::new(),
                    context: Value::Null,
                    output_format: None,
                }),
                None,
            )
            .expect("render");

        assert!(rendered.starts_with("# Task"));
        assert!(!rendered.contains("# Role"));
        assert!(!rendered.contains("# Context"));
        assert!(!rendered.contains("# Instructions"));
        assert!(!rendered.contains("# Result"));
    }
}
