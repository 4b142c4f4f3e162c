use std::collections::HashMap;

use tracing::info;

use crate::capability::{Capability, CapabilitySet};

/// Methods the relay answers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRoute {
    /// Mirrors the upstream's handshake result.
    Initialize,
    Ping,
    /// Swallowed; the relay already sent its own to the upstream.
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local(LocalRoute),
    /// Registered route; relayed upstream.
    Forward,
    /// Belongs to a known family the upstream did not announce.
    Unsupported,
    /// Not a method the relay knows about; relayed and left to the gate.
    Passthrough,
}

const FAMILY_ROUTES: [(Capability, &[&str]); 5] = [
    (Capability::Prompts, &["prompts/list", "prompts/get"]),
    (
        Capability::Resources,
        &["resources/list", "resources/read", "resources/templates/list"],
    ),
    (
        Capability::ResourcesSubscribe,
        &["resources/subscribe", "resources/unsubscribe"],
    ),
    (Capability::Logging, &["logging/setLevel"]),
    (Capability::Tools, &["tools/list", "tools/call"]),
];

const ALWAYS_FORWARDED: [&str; 3] = [
    "completion/complete",
    "notifications/progress",
    "notifications/cancelled",
];

const LOCAL: [(&str, LocalRoute); 3] = [
    ("initialize", LocalRoute::Initialize),
    ("ping", LocalRoute::Ping),
    ("notifications/initialized", LocalRoute::Initialized),
];

/// Per-session routing built from the discovered capabilities.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    routes: HashMap<&'static str, Route>,
}

impl DispatchTable {
    pub fn from_capabilities(caps: &CapabilitySet, bypass: bool) -> Self {
        let mut routes = HashMap::new();
        for (method, local) in LOCAL {
            routes.insert(method, Route::Local(local));
        }
        for method in ALWAYS_FORWARDED {
            routes.insert(method, Route::Forward);
        }
        for (family, methods) in FAMILY_ROUTES {
            let registered = bypass || caps.supports(family);
            info!(family = family.path(), registered, "dispatch family");
            let route = if registered {
                Route::Forward
            } else {
                Route::Unsupported
            };
            for method in methods {
                routes.insert(*method, route);
            }
        }
        Self { routes }
    }

    pub fn resolve(&self, method: &str) -> Route {
        self.routes
            .get(method)
            .copied()
            .unwrap_or(Route::Passthrough)
    }

    /// Methods currently relayed upstream, sorted.
    pub fn forwarded(&self) -> Vec<&'static str> {
        let mut out: Vec<_> = self
            .routes
            .iter()
            .filter(|(_, r)| **r == Route::Forward)
            .map(|(m, _)| *m)
            .collect();
        out.sort_unstable();
        out
    }
}
