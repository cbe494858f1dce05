// Agent identity detection.
//
// Every supervised process gets a stable agent id for the lifetime of its
// session. Explicit env overrides win; otherwise the id is derived from
// the detected client, the host, the pid, and a short random suffix so two
// sessions of the same client on the same host never collide.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

pub const ENV_AGENT_ID: &str = "LEASEHOLD_AGENT_ID";
pub const ENV_AGENT_TYPE: &str = "LEASEHOLD_AGENT_TYPE";
pub const ENV_CLIENT_NAME: &str = "LEASEHOLD_CLIENT_NAME";
pub const ENV_SESSION_LABEL: &str = "LEASEHOLD_SESSION_LABEL";
pub const ENV_AUTO_COORDINATION: &str = "LEASEHOLD_AUTO_COORDINATION";

/// Known coding-agent clients, used to tag leases by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Codex,
    Claude,
    Cursor,
    Aider,
    Unknown,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
            Self::Cursor => "cursor",
            Self::Aider => "aider",
            Self::Unknown => "agent",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Codex => "Codex",
            Self::Claude => "Claude Code",
            Self::Cursor => "Cursor",
            Self::Aider => "Aider",
            Self::Unknown => "Agent",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => Self::Codex,
            "claude" | "claude-code" | "claude_code" => Self::Claude,
            "cursor" => Self::Cursor,
            "aider" => Self::Aider,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity for one supervised session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_type: String,
    pub client_name: String,
    pub session_label: String,
    pub host: String,
    pub pid: u32,
}

impl AgentIdentity {
    /// Environment variables the supervised child should inherit so that
    /// tools it launches agree on who holds the leases.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_AGENT_ID, self.agent_id.clone()),
            (ENV_AGENT_TYPE, self.agent_type.clone()),
            (ENV_CLIENT_NAME, self.client_name.clone()),
            (ENV_SESSION_LABEL, self.session_label.clone()),
            (ENV_AUTO_COORDINATION, "1".to_string()),
        ]
    }
}

/// Detect the session identity from the environment.
///
/// Precedence: explicit `LEASEHOLD_*` overrides, then the `--client` flag,
/// then sniffing well-known client env vars.
pub fn detect_identity(
    env: &HashMap<String, String>,
    client_override: Option<&str>,
    repo_name: &str,
    pid: u32,
) -> AgentIdentity {
    let client = match client_override {
        Some(value) => ClientKind::parse(value),
        None => env
            .get(ENV_CLIENT_NAME)
            .map(|value| ClientKind::parse(value))
            .unwrap_or_else(|| sniff_client(env)),
    };
    let host = short_host();

    let agent_id = match env.get(ENV_AGENT_ID).map(String::as_str) {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            let suffix = &Uuid::new_v4().simple().to_string()[..6];
            format!("{}-{}-{}-{}", client.as_str(), host, pid, suffix)
        }
    };

    let agent_type = match env.get(ENV_AGENT_TYPE).map(String::as_str) {
        Some(kind) if !kind.trim().is_empty() => kind.trim().to_string(),
        _ => client.as_str().to_string(),
    };

    let session_label = match env.get(ENV_SESSION_LABEL).map(String::as_str) {
        Some(label) if !label.trim().is_empty() => label.trim().to_string(),
        _ => format!("{}-{}-{}", client.as_str(), safe_slug(repo_name), pid),
    };

    AgentIdentity {
        agent_id,
        agent_type,
        client_name: client.display_name().to_string(),
        session_label,
        host,
        pid,
    }
}

fn sniff_client(env: &HashMap<String, String>) -> ClientKind {
    if env.keys().any(|key| key.starts_with("CODEX_")) {
        return ClientKind::Codex;
    }
    if env.keys().any(|key| key.starts_with("CLAUDE_")) {
        return ClientKind::Claude;
    }
    if env.keys().any(|key| key.to_ascii_lowercase().contains("cursor")) {
        return ClientKind::Cursor;
    }
    if env.keys().any(|key| key.to_ascii_lowercase().contains("aider")) {
        return ClientKind::Aider;
    }
    ClientKind::Unknown
}

/// Lowercased `[a-z0-9_-]` slug, capped at 48 chars.
pub fn safe_slug(value: &str) -> String {
    let mut slug: String = value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' }
        })
        .collect();
    slug.truncate(48);
    if slug.is_empty() {
        slug.push_str("repo");
    }
    slug
}

/// First label of the hostname, lowercased. Falls back to `localhost`.
pub fn short_host() -> String {
    hostname::get()
        .ok()
        .and_then(|raw| raw.into_string().ok())
        .and_then(|name| name.split('.').next().map(str::to_ascii_lowercase))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
