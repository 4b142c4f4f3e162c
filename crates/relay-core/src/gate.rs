use std::collections::HashSet;
use std::sync::RwLock;

use crate::capability::{Capability, CapabilitySet};

/// Methods always let through: the session cannot start without them.
const HANDSHAKE_METHODS: [&str; 2] = ["initialize", "notifications/initialized"];

/// Methods the upstream answered with "method not found" during this session.
///
/// Insert-only; concurrent inserts of the same method are harmless.
#[derive(Debug, Default)]
pub struct DenyList {
    methods: RwLock<HashSet<String>>,
}

impl DenyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the method was not denied before.
    pub fn insert(&self, method: &str) -> bool {
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.to_string())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(method)
    }

    pub fn len(&self) -> usize {
        self.methods.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability family a method belongs to, by namespace prefix.
pub fn family_of(method: &str) -> Option<Capability> {
    if method.starts_with("resources/") {
        Some(Capability::Resources)
    } else if method.starts_with("prompts/") {
        Some(Capability::Prompts)
    } else if method.starts_with("tools/") {
        Some(Capability::Tools)
    } else {
        None
    }
}

/// Whether a call to `method` may be sent upstream. Pure; no I/O.
pub fn allow(method: &str, deny: &DenyList, caps: &CapabilitySet, bypass: bool) -> bool {
    if bypass {
        return true;
    }
    if deny.contains(method) {
        return false;
    }
    if HANDSHAKE_METHODS.contains(&method) {
        return true;
    }
    match family_of(method) {
        Some(family) => caps.supports(family),
        // Forward-compatible with extensions this relay does not know about.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools_only() -> CapabilitySet {
        CapabilitySet::from_capabilities(&json!({ "tools": {} }))
    }

    #[test]
    fn namespaces_follow_capabilities() {
        let deny = DenyList::new();
        let caps = tools_only();
        assert!(allow("tools/call", &deny, &caps, false));
        assert!(!allow("resources/list", &deny, &caps, false));
        assert!(!allow("prompts/get", &deny, &caps, false));
        assert!(allow("completion/complete", &deny, &caps, false));
        assert!(allow("x-vendor/extension", &deny, &caps, false));
    }

    #[test]
    fn handshake_methods_ignore_capabilities() {
        let deny = DenyList::new();
        let caps = CapabilitySet::default();
        assert!(allow("initialize", &deny, &caps, false));
        assert!(allow("notifications/initialized", &deny, &caps, false));
    }

    #[test]
    fn deny_list_wins_over_capabilities_but_not_bypass() {
        let deny = DenyList::new();
        let caps = CapabilitySet::everything();
        assert!(deny.insert("tools/call"));
        assert!(!deny.insert("tools/call"));
        assert_eq!(deny.len(), 1);

        assert!(!allow("tools/call", &deny, &caps, false));
        assert!(allow("tools/call", &deny, &caps, true));
        assert!(allow("resources/list", &deny, &CapabilitySet::default(), true));
    }

    #[test]
    fn concurrent_inserts_are_a_set_union() {
        let deny = std::sync::Arc::new(DenyList::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let deny = deny.clone();
                std::thread::spawn(move || {
                    deny.insert("prompts/get");
                    deny.insert(&format!("m{}", i % 2));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(deny.len(), 3);
    }
}
