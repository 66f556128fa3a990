//! Task definitions and the tagged union of task payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of delegated work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Invoke an agent persona with a prompt.
    Agent,
    /// Run a named skill with structured arguments.
    Skill,
    /// Call an in-process Rust function.
    Function,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Agent => "agent",
            TaskKind::Skill => "skill",
            TaskKind::Function => "function",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, registered capability with its output contract.
///
/// Definitions are immutable once registered; the registry is the source of
/// truth for the schema used at call time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    pub output_schema: Value,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, kind: TaskKind, output_schema: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            input_schema: None,
            output_schema,
        }
    }

    pub fn agent(name: impl Into<String>, output_schema: Value) -> Self {
        Self::new(name, TaskKind::Agent, output_schema)
    }

    pub fn skill(name: impl Into<String>, output_schema: Value) -> Self {
        Self::new(name, TaskKind::Skill, output_schema)
    }

    pub fn function(name: impl Into<String>, output_schema: Value) -> Self {
        Self::new(name, TaskKind::Function, output_schema)
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

/// Prompt sections handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPrompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub agent: String,
    pub prompt: AgentPrompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillInvocation {
    pub skill: String,
    #[serde(default)]
    pub args: Value,
}

/// Arguments of one `ctx.task` call, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskPayload {
    Agent(AgentInvocation),
    Skill(SkillInvocation),
    Function { args: Value },
}

impl TaskPayload {
    pub fn agent(agent: impl Into<String>, prompt: AgentPrompt) -> Self {
        TaskPayload::Agent(AgentInvocation {
            agent: agent.into(),
            prompt,
        })
    }

    pub fn skill(skill: impl Into<String>, args: Value) -> Self {
        TaskPayload::Skill(SkillInvocation {
            skill: skill.into(),
            args,
        })
    }

    pub fn function(args: Value) -> Self {
        TaskPayload::Function { args }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Agent(_) => TaskKind::Agent,
            TaskPayload::Skill(_) => TaskKind::Skill,
            TaskPayload::Function { .. } => TaskKind::Function,
        }
    }

    /// The structured arguments an input schema applies to.
    pub fn arguments(&self) -> &Value {
        match self {
            TaskPayload::Agent(invocation) => &invocation.prompt.context,
            TaskPayload::Skill(invocation) => &invocation.args,
            TaskPayload::Function { args } => args,
        }
    }
}
