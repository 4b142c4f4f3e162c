use serde_json::Value;

/// Capability paths the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Prompts,
    Resources,
    ResourcesSubscribe,
    Logging,
    Tools,
    Completions,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Prompts,
        Capability::Resources,
        Capability::ResourcesSubscribe,
        Capability::Logging,
        Capability::Tools,
        Capability::Completions,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Capability::Prompts => "prompts",
            Capability::Resources => "resources",
            Capability::ResourcesSubscribe => "resources.subscribe",
            Capability::Logging => "logging",
            Capability::Tools => "tools",
            Capability::Completions => "completions",
        }
    }

    /// `None` for paths outside the recognized set.
    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.path() == path)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ResourceFlags {
    subscribe: bool,
}

/// What the upstream announced during the handshake. Read-only once built.
///
/// Unknown or malformed data always reads as unsupported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    prompts: bool,
    resources: Option<ResourceFlags>,
    logging: bool,
    tools: bool,
    completions: bool,
}

/// MCP announces a family with an object (often empty); a literal `true` is
/// accepted too. Anything else means absent.
fn present(v: Option<&Value>) -> bool {
    matches!(v, Some(Value::Bool(true)) | Some(Value::Object(_)))
}

impl CapabilitySet {
    /// Derives the set from an `initialize` result. Never fails.
    pub fn discover(handshake_result: &Value) -> Self {
        Self::from_capabilities(handshake_result.get("capabilities").unwrap_or(&Value::Null))
    }

    /// Derives the set from a bare capabilities object.
    pub fn from_capabilities(caps: &Value) -> Self {
        let Some(obj) = caps.as_object() else {
            return Self::default();
        };

        let resources = obj.get("resources");
        let resources = present(resources).then(|| ResourceFlags {
            subscribe: resources
                .and_then(|r| r.get("subscribe"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });

        Self {
            prompts: present(obj.get("prompts")),
            resources,
            logging: present(obj.get("logging")),
            tools: present(obj.get("tools")),
            completions: present(obj.get("completions")),
        }
    }

    /// Every family supported; used when gating is bypassed.
    pub fn everything() -> Self {
        Self {
            prompts: true,
            resources: Some(ResourceFlags { subscribe: true }),
            logging: true,
            tools: true,
            completions: true,
        }
    }

    pub fn supports(&self, cap: Capability) -> bool {
        match cap {
            Capability::Prompts => self.prompts,
            Capability::Resources => self.resources.is_some(),
            Capability::ResourcesSubscribe => self.resources.is_some_and(|r| r.subscribe),
            Capability::Logging => self.logging,
            Capability::Tools => self.tools,
            Capability::Completions => self.completions,
        }
    }

    /// Dotted-path query; unrecognized paths are unsupported.
    pub fn query(&self, path: &str) -> bool {
        Capability::from_path(path).is_some_and(|c| self.supports(c))
    }

    pub fn supported(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.supports(*c))
            .collect()
    }
}
